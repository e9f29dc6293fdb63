//! Minimal managed type system backing dispatch.
//!
//! Type descriptors are data-heap blocks whose address is the type identity
//! that dispatch stubs compare against. Objects store their type handle in
//! their first word. Method bodies are native entry points; only their
//! addresses matter here.
use crate::{
    error::Fault,
    memory::{Address, AddressSpace, WORD_SIZE},
    sync::{Arc, AtomicU64, Ordering},
};
use dashmap::DashMap;
use std::fmt;
use tracing::debug;

/// Identifies one virtual slot across every implementing type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchToken(pub u64);

impl fmt::Display for DispatchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token#{}", self.0)
    }
}

/// Descriptor layout, in words.
pub mod descriptor {
    pub const PARENT: i32 = 0;
    pub const TYPE_ID: i32 = 8;
    pub const INSTANCE_WORDS: i32 = 16;
    pub const SIZE: u64 = 32;
}

/// Answers "which method does `type_handle` run for `token`".
pub trait TypeSystem: Send + Sync {
    fn resolve(&self, type_handle: Address, token: DispatchToken) -> Option<Address>;

    fn describe_type(&self, type_handle: Address) -> String {
        type_handle.to_string()
    }
}

pub struct TypeRegistry {
    memory: Arc<AddressSpace>,
    names: DashMap<Address, String>,
    methods: DashMap<(Address, DispatchToken), Address>,
    method_names: DashMap<Address, String>,
    next_type_id: AtomicU64,
    next_token: AtomicU64,
}

impl TypeRegistry {
    pub fn new(memory: Arc<AddressSpace>) -> Self {
        Self {
            memory,
            names: DashMap::new(),
            methods: DashMap::new(),
            method_names: DashMap::new(),
            next_type_id: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn define_type(
        &self,
        name: &str,
        parent: Option<Address>,
        instance_words: u64,
    ) -> Result<Address, Fault> {
        let handle = self.memory.allocate_data(descriptor::SIZE, 32)?;
        let id = self.next_type_id.fetch_add(1, Ordering::Relaxed);
        self.memory.store_word(
            handle.offset(descriptor::PARENT as i64),
            parent.unwrap_or(Address::NULL).as_u64(),
        )?;
        self.memory
            .store_word(handle.offset(descriptor::TYPE_ID as i64), id)?;
        self.memory
            .store_word(handle.offset(descriptor::INSTANCE_WORDS as i64), instance_words)?;
        self.names.insert(handle, name.to_string());
        debug!(%handle, name, "defined type");
        Ok(handle)
    }

    pub fn new_token(&self) -> DispatchToken {
        DispatchToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Give `type_handle` its own body for `token`; returns the body's entry point.
    pub fn implement(
        &self,
        type_handle: Address,
        token: DispatchToken,
        name: &str,
    ) -> Result<Address, Fault> {
        let entry = self.memory.reserve_native_entry()?;
        self.methods.insert((type_handle, token), entry);
        self.method_names.insert(entry, name.to_string());
        Ok(entry)
    }

    pub fn parent_of(&self, type_handle: Address) -> Result<Option<Address>, Fault> {
        let parent = self
            .memory
            .load_word(type_handle.offset(descriptor::PARENT as i64))?;
        Ok((parent != 0).then_some(Address(parent)))
    }

    pub fn allocate_object(&self, type_handle: Address) -> Result<Address, Fault> {
        let words = self
            .memory
            .load_word(type_handle.offset(descriptor::INSTANCE_WORDS as i64))?;
        let object = self.memory.allocate_data((words + 1) * WORD_SIZE, 8)?;
        self.memory.store_word(object, type_handle.as_u64())?;
        Ok(object)
    }

    pub fn type_of(&self, object: Address) -> Result<Address, Fault> {
        Ok(Address(self.memory.load_word(object)?))
    }

    pub fn type_name(&self, type_handle: Address) -> Option<String> {
        self.names.get(&type_handle).map(|n| n.clone())
    }

    pub fn method_name(&self, entry: Address) -> Option<String> {
        self.method_names.get(&entry).map(|n| n.clone())
    }
}

impl TypeSystem for TypeRegistry {
    fn resolve(&self, type_handle: Address, token: DispatchToken) -> Option<Address> {
        let mut current = Some(type_handle);
        while let Some(ty) = current {
            if let Some(entry) = self.methods.get(&(ty, token)) {
                return Some(*entry);
            }
            current = self.parent_of(ty).ok().flatten();
        }
        None
    }

    fn describe_type(&self, type_handle: Address) -> String {
        self.type_name(type_handle)
            .unwrap_or_else(|| type_handle.to_string())
    }
}
