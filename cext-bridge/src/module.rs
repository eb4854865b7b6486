//! Loaded extension modules.
//!
//! Modules are reachable two ways once loaded: by the integer index stored
//! in their native definition (the table grows with holes to reach it) and
//! by the `(path, name)` pair they were loaded from.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::loader::LoadedLibrary;

/// Attribute name holding the file an extension was loaded from.
pub const FILE_ATTRIBUTE: &str = "__file__";

/// Attribute name holding the library an extension lives in.
pub const LIBRARY_ATTRIBUTE: &str = "__library__";

/// A value stored on a module object by the bridge.
#[derive(Clone)]
pub enum ModuleAttribute {
    /// A string.
    Str(String),
    /// The library backing the module.
    Library(Arc<dyn LoadedLibrary>),
    /// A native address.
    Pointer(usize),
}

impl ModuleAttribute {
    /// The string value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ModuleAttribute::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// The library, if this is a library.
    pub fn as_library(&self) -> Option<&Arc<dyn LoadedLibrary>> {
        match self {
            ModuleAttribute::Library(lib) => Some(lib),
            _ => None,
        }
    }
}

impl fmt::Debug for ModuleAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleAttribute::Str(s) => f.debug_tuple("Str").field(s).finish(),
            ModuleAttribute::Library(lib) => f.debug_tuple("Library").field(&lib.path()).finish(),
            ModuleAttribute::Pointer(p) => write!(f, "Pointer({:#x})", p),
        }
    }
}

/// A managed module object as seen by the bridge.
pub trait ExtensionModule: Send + Sync {
    /// Fully qualified module name.
    fn name(&self) -> &str;

    /// Set an attribute.
    fn set_attribute(&self, name: &str, value: ModuleAttribute);

    /// Read an attribute.
    fn attribute(&self, name: &str) -> Option<ModuleAttribute>;
}

impl fmt::Debug for dyn ExtensionModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionModule")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// Shared handle to a module object.
pub type ModuleRef = Arc<dyn ExtensionModule>;

/// A module object that is nothing but a name and an attribute map.
pub struct AttributeModule {
    name: String,
    attributes: Mutex<HashMap<String, ModuleAttribute>>,
}

impl AttributeModule {
    /// Create an empty module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Mutex::new(HashMap::new()),
        }
    }
}

impl ExtensionModule for AttributeModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_attribute(&self, name: &str, value: ModuleAttribute) {
        self.attributes.lock().insert(name.to_owned(), value);
    }

    fn attribute(&self, name: &str) -> Option<ModuleAttribute> {
        self.attributes.lock().get(name).cloned()
    }
}

impl fmt::Debug for AttributeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeModule")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Where an extension was loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtensionKey {
    /// Path of the loadable unit.
    pub path: String,
    /// Extension name.
    pub name: String,
}

impl ExtensionKey {
    /// Create a key.
    pub fn new(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
        }
    }
}

/// Index of loaded single-phase extension modules.
#[derive(Default)]
pub struct ModuleIndexTable {
    by_index: Vec<Option<ModuleRef>>,
    /// Native definition address per extension.
    extensions: HashMap<ExtensionKey, usize>,
}

impl ModuleIndexTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `module` at `index`, growing the table with holes as needed.
    pub fn insert(&mut self, index: usize, module: ModuleRef) {
        if self.by_index.len() <= index {
            self.by_index.resize_with(index + 1, || None);
        }
        self.by_index[index] = Some(module);
    }

    /// The module at `index`.
    pub fn get(&self, index: usize) -> Option<ModuleRef> {
        self.by_index.get(index)?.clone()
    }

    /// Record the native definition an extension was initialized from.
    pub fn record_extension(&mut self, key: ExtensionKey, definition: usize) {
        self.extensions.insert(key, definition);
    }

    /// The native definition recorded for an extension.
    pub fn find_extension(&self, path: &str, name: &str) -> Option<usize> {
        // Keys are owned, so build one for the lookup.
        self.extensions.get(&ExtensionKey::new(path, name)).copied()
    }

    /// Length of the index space, holes included.
    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    /// Whether no module was ever inserted.
    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    /// Number of populated indices.
    pub fn module_count(&self) -> usize {
        self.by_index.iter().filter(|m| m.is_some()).count()
    }

    /// Number of recorded extensions.
    pub fn extension_count(&self) -> usize {
        self.extensions.len()
    }
}

impl fmt::Debug for ModuleIndexTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleIndexTable")
            .field("len", &self.by_index.len())
            .field("modules", &self.module_count())
            .field("extensions", &self.extensions.len())
            .finish()
    }
}
