//! Populating the [`Hierarchy`] from input modules and platform stubs.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use crate::classfile::ClassFile;
use crate::error::Error;
use crate::hierarchy::{ClassDescriptor, Hierarchy, HierarchyError};
use crate::source::{ModuleSource, StubSource};

pub const CLASS_SUFFIX: &str = ".class";

/// One application class read during [`scan`].
#[derive(Debug, Clone)]
pub struct ScannedClass {
    /// Name of the module it came from.
    pub module: String,
    pub name: String,
    pub class_file: ClassFile,
}

#[derive(Debug, Default)]
pub struct Scan {
    pub hierarchy: Hierarchy,
    pub classes: Vec<ScannedClass>,
}

fn is_class_module(name: &str) -> bool {
    name.ends_with(CLASS_SUFFIX) && !name.rsplit('/').next().is_some_and(|f| f.starts_with("module-info"))
}

/// Reads every class module of `source` into application descriptors.
/// Other modules are ignored.
pub fn scan(source: &dyn ModuleSource) -> Result<Scan, Error> {
    let mut scan = Scan::default();
    for module in source.module_names()? {
        if !is_class_module(&module) {
            continue;
        }
        let parsed = source
            .read_module(&module)
            .map_err(Error::from)
            .and_then(|bytes| ClassFile::parse(&bytes).map_err(Error::from))
            .and_then(|class_file| {
                let descriptor = ClassDescriptor::from_class_file(&class_file)?;
                Ok((class_file, descriptor))
            });
        let (class_file, descriptor) = parsed.map_err(|e| e.in_module(&module))?;
        let name = descriptor.name.clone();
        scan.hierarchy.add(descriptor).map_err(|e| Error::from(e).in_module(&module))?;
        scan.classes.push(ScannedClass { module, name, class_file });
    }
    debug!(classes = scan.classes.len(), "scanned application modules");
    Ok(scan)
}

/// Breadth-first fetch of platform types starting at `seeds`. Every fetched
/// type's superclass and interfaces are enqueued in turn; names already in
/// the hierarchy are not fetched again. Returns the number of library
/// descriptors added.
pub fn resolve_platform_closure(
    hierarchy: &mut Hierarchy,
    seeds: &[String],
    stubs: &dyn StubSource,
) -> Result<usize, Error> {
    let mut queue: VecDeque<String> = seeds.iter().cloned().collect();
    let mut visited: HashSet<String> = HashSet::new();
    let mut added = 0;
    while let Some(name) = queue.pop_front() {
        if !visited.insert(name.clone()) || hierarchy.contains(&name) {
            continue;
        }
        let bytes = stubs.fetch_stub(&name)?.ok_or_else(|| HierarchyError::MissingStub(name.clone()))?;
        let descriptor = ClassFile::parse(&bytes)
            .and_then(|class_file| ClassDescriptor::from_class_file(&class_file))
            .map_err(|e| Error::from(e).in_module(&format!("{name}{CLASS_SUFFIX}")))?;
        queue.extend(descriptor.super_name.iter().cloned());
        queue.extend(descriptor.interfaces.iter().cloned());
        debug!(class = %name, "fetched platform stub");
        hierarchy.add_library(descriptor)?;
        added += 1;
    }
    Ok(added)
}
