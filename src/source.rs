//! Where modules come from and where rewritten ones go.
//!
//! A module is one named byte blob, normally a `.class` file keyed by its
//! '/'-separated path (`com/acme/Driver.class`). Directories, in-memory maps
//! and (with the `jar` feature) jar archives can all serve as sources.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Input modules for one instrumentation run.
pub trait ModuleSource {
    fn module_names(&self) -> io::Result<Vec<String>>;
    fn read_module(&self, name: &str) -> io::Result<Vec<u8>>;
}

/// Class files for platform types (`java/sql/Connection`) that are not part
/// of the input. `Ok(None)` means the type is unknown to this source.
pub trait StubSource {
    fn fetch_stub(&self, type_name: &str) -> io::Result<Option<Vec<u8>>>;
}

/// Destination for rewritten modules.
pub trait OutputSink {
    fn write_module(&mut self, name: &str, bytes: &[u8]) -> io::Result<()>;
}

fn module_path(root: &Path, name: &str) -> PathBuf {
    name.split('/').fold(root.to_path_buf(), |path, part| path.join(part))
}

/// All files below a directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn walk(&self, dir: &Path, prefix: &str, names: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let name = if prefix.is_empty() { file_name } else { format!("{prefix}/{file_name}") };
            if entry.file_type()?.is_dir() {
                self.walk(&entry.path(), &name, names)?;
            } else {
                names.push(name);
            }
        }
        Ok(())
    }
}

impl ModuleSource for DirectorySource {
    fn module_names(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        self.walk(&self.root, "", &mut names)?;
        names.sort();
        Ok(names)
    }

    fn read_module(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(module_path(&self.root, name))
    }
}

/// Writes modules below a directory, creating parents as needed.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl OutputSink for DirectorySink {
    fn write_module(&mut self, name: &str, bytes: &[u8]) -> io::Result<()> {
        let path = module_path(&self.root, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)
    }
}

/// Stubs laid out as `<root>/<type name>.class`, e.g. an unpacked JDK module.
#[derive(Debug, Clone)]
pub struct DirectoryStubSource {
    root: PathBuf,
}

impl DirectoryStubSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StubSource for DirectoryStubSource {
    fn fetch_stub(&self, type_name: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(module_path(&self.root, &format!("{type_name}.class"))) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Modules held in memory. Usable as a source, a sink and a stub source.
#[derive(Debug, Clone, Default)]
pub struct MemoryModules {
    modules: BTreeMap<String, Vec<u8>>,
}

impl MemoryModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: Vec<u8>) -> Option<Vec<u8>> {
        self.modules.insert(name.into(), bytes)
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.modules.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl ModuleSource for MemoryModules {
    fn module_names(&self) -> io::Result<Vec<String>> {
        Ok(self.modules.keys().cloned().collect())
    }

    fn read_module(&self, name: &str) -> io::Result<Vec<u8>> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no module {name}")))
    }
}

impl OutputSink for MemoryModules {
    fn write_module(&mut self, name: &str, bytes: &[u8]) -> io::Result<()> {
        self.modules.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }
}

impl StubSource for MemoryModules {
    fn fetch_stub(&self, type_name: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.modules.get(&format!("{type_name}.class")).cloned())
    }
}

/// Stubs keyed directly by type name.
impl StubSource for HashMap<String, Vec<u8>> {
    fn fetch_stub(&self, type_name: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.get(type_name).cloned())
    }
}

#[cfg(feature = "jar")]
pub use jar::{JarSource, JarStubSource};

#[cfg(feature = "jar")]
mod jar {
    use std::fs::File;
    use std::io::{self, Read};
    use std::path::Path;
    use std::sync::{Mutex, PoisonError};

    use zip::result::ZipError;
    use zip::ZipArchive;

    use super::{ModuleSource, StubSource};

    fn zip_error(e: ZipError) -> io::Error {
        match e {
            ZipError::Io(e) => e,
            ZipError::FileNotFound => io::Error::new(io::ErrorKind::NotFound, e),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }

    /// Entries of a jar archive.
    pub struct JarSource {
        archive: Mutex<ZipArchive<File>>,
    }

    impl JarSource {
        pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
            let file = File::open(path)?;
            let archive = ZipArchive::new(file).map_err(zip_error)?;
            Ok(Self { archive: Mutex::new(archive) })
        }

        fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
            let mut archive = self.archive.lock().unwrap_or_else(PoisonError::into_inner);
            let mut entry = match archive.by_name(name) {
                Ok(entry) => entry,
                Err(ZipError::FileNotFound) => return Ok(None),
                Err(e) => return Err(zip_error(e)),
            };
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            Ok(Some(bytes))
        }
    }

    impl ModuleSource for JarSource {
        fn module_names(&self) -> io::Result<Vec<String>> {
            let archive = self.archive.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(archive.file_names().filter(|n| !n.ends_with('/')).map(str::to_string).collect())
        }

        fn read_module(&self, name: &str) -> io::Result<Vec<u8>> {
            self.read(name)?
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no entry {name}")))
        }
    }

    /// Stubs looked up as `<type name>.class` entries of a jar.
    pub struct JarStubSource(JarSource);

    impl JarStubSource {
        pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
            JarSource::open(path).map(Self)
        }
    }

    impl StubSource for JarStubSource {
        fn fetch_stub(&self, type_name: &str) -> io::Result<Option<Vec<u8>>> {
            self.0.read(&format!("{type_name}.class"))
        }
    }
}
