//! Mark assignment.
//!
//! A mark records, for one (class, method) pair, why that method is traced.
//! Two passes fill the table:
//!
//! * the family pass stamps, for every concrete class implementing a family
//!   type, the nearest superclass that actually declares each family method,
//!   labelled with the family interface that declared it;
//! * the blanket pass stamps constructors and non-inherited public methods of
//!   data source implementations with their own class name, without touching
//!   anything the family pass already labelled.

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;
use tracing::debug;

use crate::families::Family;
use crate::hierarchy::{ClassKind, Hierarchy, HierarchyError, MethodSignature};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MarkError {
    #[error("{class}.{signature} is marked both {existing} and {new}")]
    Conflict { class: String, signature: MethodSignature, existing: String, new: String },
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MarkTable {
    marks: BTreeMap<String, BTreeMap<MethodSignature, String>>,
}

impl MarkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `label` for the pair. Re-marking with the same label is a no-op;
    /// a different label is a conflict.
    pub fn mark(&mut self, class: &str, signature: &MethodSignature, label: &str) -> Result<(), MarkError> {
        let entries = self.marks.entry(class.to_string()).or_default();
        match entries.get(signature) {
            Some(existing) if existing != label => Err(MarkError::Conflict {
                class: class.to_string(),
                signature: signature.clone(),
                existing: existing.clone(),
                new: label.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                entries.insert(signature.clone(), label.to_string());
                Ok(())
            }
        }
    }

    /// Records `label` unless the pair already has one. Returns whether it did.
    pub fn mark_if_absent(&mut self, class: &str, signature: &MethodSignature, label: &str) -> bool {
        let entries = self.marks.entry(class.to_string()).or_default();
        if entries.contains_key(signature) {
            return false;
        }
        entries.insert(signature.clone(), label.to_string());
        true
    }

    pub fn label(&self, class: &str, signature: &MethodSignature) -> Option<&str> {
        self.marks.get(class)?.get(signature).map(String::as_str)
    }

    pub fn marks_for(&self, class: &str) -> Option<&BTreeMap<MethodSignature, String>> {
        self.marks.get(class).filter(|m| !m.is_empty())
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.marks.iter().filter(|(_, m)| !m.is_empty()).map(|(c, _)| c.as_str())
    }

    /// Total number of marked (class, method) pairs.
    pub fn len(&self) -> usize {
        self.marks.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs both passes over every concrete class in `hierarchy`.
pub fn assign(hierarchy: &Hierarchy, families: &[Family], root: &str) -> Result<MarkTable, MarkError> {
    let mut table = MarkTable::new();
    let concrete: Vec<_> = hierarchy.classes().filter(|c| c.kind == ClassKind::Concrete).collect();

    for class in &concrete {
        for family in families {
            for member in &family.members {
                if hierarchy.has_ancestor(&class.name, member) {
                    mark_family_methods(hierarchy, &mut table, &class.name, member, root)?;
                }
            }
        }
    }

    for class in &concrete {
        for family in families.iter().filter(|f| f.blanket) {
            for member in &family.members {
                if hierarchy.has_ancestor(&class.name, member) {
                    mark_blanket(hierarchy, &mut table, &class.name, root)?;
                }
            }
        }
    }

    Ok(table)
}

fn mark_family_methods(
    hierarchy: &Hierarchy,
    table: &mut MarkTable,
    class: &str,
    family_root: &str,
    root: &str,
) -> Result<(), MarkError> {
    let signatures = collect_signatures(hierarchy, family_root, root)?;
    let chain = hierarchy.superclass_chain(class)?;
    for (signature, label) in &signatures {
        match chain.iter().find(|c| c.declares(signature)) {
            Some(owner) => table.mark(&owner.name, signature, label)?,
            None => debug!(class, signature = %signature, family = %label, "not marked"),
        }
    }
    Ok(())
}

/// Every method declared by `family_root` and its superinterfaces, labelled
/// with the first (preorder) interface that declares it.
pub fn collect_signatures(
    hierarchy: &Hierarchy,
    family_root: &str,
    root: &str,
) -> Result<BTreeMap<MethodSignature, String>, HierarchyError> {
    let mut signatures = BTreeMap::new();
    let mut seen = HashSet::new();
    let mut pending = vec![family_root.to_string()];
    while let Some(name) = pending.pop() {
        if name == root {
            return Err(HierarchyError::FamilyRootIsObject);
        }
        if !seen.insert(name.clone()) {
            continue;
        }
        let class = hierarchy.get(&name)?;
        if let Some(super_name) = class.super_name.as_deref().filter(|s| *s != root) {
            return Err(HierarchyError::FamilyRootSuper { root: name.clone(), super_name: super_name.to_string() });
        }
        for method in class.methods.iter().filter(|m| m.signature.name != "<clinit>") {
            signatures.entry(method.signature.clone()).or_insert_with(|| class.name.clone());
        }
        pending.extend(class.interfaces.iter().rev().cloned());
    }
    Ok(signatures)
}

fn mark_blanket(hierarchy: &Hierarchy, table: &mut MarkTable, class: &str, root: &str) -> Result<(), MarkError> {
    let chain = hierarchy.superclass_chain(class)?;
    if !chain.iter().any(|c| c.name == root) {
        return Err(HierarchyError::UnrootedChain(class.to_string()).into());
    }

    let inherited: HashSet<&MethodSignature> = chain
        .iter()
        .filter(|c| hierarchy.is_library(&c.name))
        .flat_map(|c| c.methods.iter())
        .filter(|m| m.is_public())
        .map(|m| &m.signature)
        .collect();

    for ancestor in chain.iter().take_while(|c| c.name != root && !hierarchy.is_library(&c.name)) {
        for method in ancestor.methods.iter().filter(|m| m.is_public()) {
            if method.signature.is_constructor() || !inherited.contains(&method.signature) {
                table.mark_if_absent(&ancestor.name, &method.signature, &ancestor.name);
            }
        }
    }
    Ok(())
}
