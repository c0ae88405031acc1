//! Crate-level error type.

use std::io;

use thiserror::Error;

use crate::bytecode::BytecodeError;
use crate::classfile::ClassFileError;
use crate::config::ConfigError;
use crate::descriptor::DescriptorError;
use crate::hierarchy::HierarchyError;
use crate::marks::MarkError;
use crate::rewriter::RewriteError;
use crate::runtime::CallbackError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    ClassFile(#[from] ClassFileError),
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),
    #[error(transparent)]
    Mark(#[from] MarkError),
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Callback(#[from] CallbackError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{name}: {source}")]
    Module { name: String, source: Box<Error> },
}

impl Error {
    /// Attaches the module (archive entry) the error arose in.
    pub fn in_module(self, name: &str) -> Self {
        match self {
            already @ Error::Module { .. } => already,
            other => Error::Module { name: name.to_string(), source: Box::new(other) },
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
