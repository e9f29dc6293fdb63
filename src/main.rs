use std::process::ExitCode;

fn main() -> ExitCode {
    dotnet_stubs::run_cli()
}
