//! Cross-module class hierarchy.
//!
//! Every class the run knows about, whether scanned from the input modules
//! (application) or pulled in from platform stubs (library), lives here as a
//! [`ClassDescriptor`] keyed by its internal name. Descriptors are immutable
//! once inserted.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt;

use thiserror::Error;

use crate::classfile::{ClassFile, ClassFileError, ACC_ABSTRACT, ACC_INTERFACE, ACC_PUBLIC};
use crate::descriptor::{FieldType, MethodType};
use crate::runtime::{MethodLookup, ResolvedMethod};

/// The universal root of the class hierarchy.
pub const OBJECT: &str = "java/lang/Object";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HierarchyError {
    #[error("class {0} defined more than once")]
    DuplicateClass(String),
    #[error("class {0} is not part of the hierarchy")]
    MissingClass(String),
    #[error("platform stub for {0} not found")]
    MissingStub(String),
    #[error("superclass chain of {0} is cyclic")]
    Cycle(String),
    #[error("superclass chain of {0} never reaches {OBJECT}")]
    UnrootedChain(String),
    #[error("family type {root} extends {super_name}; only {OBJECT} is allowed")]
    FamilyRootSuper { root: String, super_name: String },
    #[error("{OBJECT} cannot be a family type")]
    FamilyRootIsObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Concrete,
    Abstract,
    Interface,
}

impl ClassKind {
    pub fn from_access(access_flags: u16) -> Self {
        if access_flags & ACC_INTERFACE != 0 {
            ClassKind::Interface
        } else if access_flags & ACC_ABSTRACT != 0 {
            ClassKind::Abstract
        } else {
            ClassKind::Concrete
        }
    }
}

/// Method identity: name plus descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodSignature {
    pub name: String,
    pub descriptor: String,
}

impl MethodSignature {
    pub fn new(name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self { name: name.into(), descriptor: descriptor.into() }
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.descriptor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub signature: MethodSignature,
    pub access_flags: u16,
}

impl MethodDescriptor {
    pub fn is_public(&self) -> bool {
        self.access_flags & ACC_PUBLIC != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDescriptor {
    pub name: String,
    pub kind: ClassKind,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub methods: Vec<MethodDescriptor>,
}

impl ClassDescriptor {
    pub fn from_class_file(class: &ClassFile) -> Result<Self, ClassFileError> {
        let cp = &class.constant_pool;
        let methods = class
            .methods
            .iter()
            .map(|m| {
                Ok(MethodDescriptor {
                    signature: MethodSignature::new(m.name(cp)?, m.descriptor(cp)?),
                    access_flags: m.access_flags,
                })
            })
            .collect::<Result<Vec<_>, ClassFileError>>()?;
        Ok(Self {
            name: class.name()?.to_string(),
            kind: ClassKind::from_access(class.access_flags),
            super_name: class.super_name()?.map(str::to_string),
            interfaces: class.interface_names()?.into_iter().map(str::to_string).collect(),
            methods,
        })
    }

    pub fn declares(&self, signature: &MethodSignature) -> bool {
        self.methods.iter().any(|m| &m.signature == signature)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Hierarchy {
    classes: BTreeMap<String, ClassDescriptor>,
    library: BTreeSet<String>,
}

impl Hierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an application descriptor.
    pub fn add(&mut self, class: ClassDescriptor) -> Result<(), HierarchyError> {
        if self.classes.contains_key(&class.name) {
            return Err(HierarchyError::DuplicateClass(class.name));
        }
        self.classes.insert(class.name.clone(), class);
        Ok(())
    }

    /// Inserts a read-only platform descriptor.
    pub fn add_library(&mut self, class: ClassDescriptor) -> Result<(), HierarchyError> {
        let name = class.name.clone();
        self.add(class)?;
        self.library.insert(name);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn is_library(&self, name: &str) -> bool {
        self.library.contains(name)
    }

    pub fn get(&self, name: &str) -> Result<&ClassDescriptor, HierarchyError> {
        self.classes.get(name).ok_or_else(|| HierarchyError::MissingClass(name.to_string()))
    }

    pub fn try_get(&self, name: &str) -> Option<&ClassDescriptor> {
        self.classes.get(name)
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.classes.values()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn library_len(&self) -> usize {
        self.library.len()
    }

    /// The direct superclass, if it is known to the hierarchy.
    pub fn super_class(&self, class: &ClassDescriptor) -> Option<&ClassDescriptor> {
        class.super_name.as_deref().and_then(|s| self.classes.get(s))
    }

    /// True if `ancestor` is reachable from `name` through superclass or
    /// interface edges. A class is not its own ancestor; unknown names
    /// contribute no edges.
    pub fn has_ancestor(&self, name: &str, ancestor: &str) -> bool {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut pending: Vec<&str> = vec![name];
        while let Some(current) = pending.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(class) = self.classes.get(current) else {
                continue;
            };
            let parents = class.super_name.iter().chain(class.interfaces.iter());
            for parent in parents {
                if parent == ancestor {
                    return true;
                }
                pending.push(parent.as_str());
            }
        }
        false
    }

    /// `name` followed by its superclasses, nearest first, ending at the first
    /// superclass missing from the hierarchy.
    pub fn superclass_chain(&self, name: &str) -> Result<Vec<&ClassDescriptor>, HierarchyError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(self.get(name)?);
        while let Some(class) = current {
            if !seen.insert(class.name.as_str()) {
                return Err(HierarchyError::Cycle(name.to_string()));
            }
            chain.push(class);
            current = self.super_class(class);
        }
        Ok(chain)
    }

    /// `name`, then its superinterfaces breadth-first, then its superclasses.
    fn lookup_order(&self, name: &str) -> Vec<&ClassDescriptor> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(name);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(class) = self.classes.get(current) {
                queue.extend(class.interfaces.iter().map(String::as_str));
                order.push(class);
            }
        }
        let mut next = self.classes.get(name).and_then(|c| self.super_class(c));
        while let Some(class) = next {
            if !seen.insert(class.name.as_str()) {
                break;
            }
            order.push(class);
            next = self.super_class(class);
        }
        order
    }
}

impl MethodLookup for Hierarchy {
    fn find_method(&self, owner: &str, name: &str, params: &[FieldType]) -> Option<ResolvedMethod> {
        for class in self.lookup_order(owner) {
            for method in class.methods.iter().filter(|m| m.signature.name == name) {
                let Ok(method_type) = MethodType::parse(&method.signature.descriptor) else {
                    continue;
                };
                if method_type.params == params {
                    return Some(ResolvedMethod { declaring_type: class.name.clone(), method_type });
                }
            }
        }
        None
    }
}
