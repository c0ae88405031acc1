//! # jdbc-tracing
//!
//! Build-time bytecode instrumentation for JDBC drivers and pools, plus the
//! in-process callback layer the instrumented code reports to.
//!
//! Given a set of compiled classes, the crate works out which methods
//! implement the JDBC surface (`DataSource`, `Connection`, `Statement`, the
//! pooled and XA variants, `InvocationHandler` proxies and `XAResource`),
//! and rewrites exactly those methods so every call reports entry, return and
//! failure to a [`TracingCallback`](runtime::TracingCallback).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use jdbc_tracing::{DirectorySink, DirectorySource, DirectoryStubSource, InstrumentConfig, Instrumenter};
//!
//! let classes = DirectorySource::new("target/classes");
//! let jdk = DirectoryStubSource::new("/opt/jdk-stubs");
//! let mut out = DirectorySink::new("target/classes");
//!
//! let config = InstrumentConfig::from_options("holder=acme/trace/Tracer")?;
//! let written = Instrumenter::new(config).run(&classes, &jdk, &mut out)?;
//! println!("rewrote {written} classes");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │            Module I/O (source: dirs, memory, jars)       │
//! ├─────────────────────────────────────────────────────────┤
//! │   resolver: scan + platform closure  ->  hierarchy       │
//! ├─────────────────────────────────────────────────────────┤
//! │   marks: family pass, blanket pass  ->  MarkTable        │
//! ├─────────────────────────────────────────────────────────┤
//! │   rewriter: advice over bytecode, stackmap, descriptor   │
//! ├─────────────────────────────────────────────────────────┤
//! │              classfile: parse / serialise                │
//! └─────────────────────────────────────────────────────────┘
//!          at run time:  traced code  ->  runtime::registry
//!                        ->  FilterTracingCallback  ->  your callback
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`classfile`] | Class file model, parser and writer |
//! | [`descriptor`] | Field and method descriptors |
//! | [`bytecode`] | Instruction decoding and relocation-aware assembly |
//! | [`stackmap`] | StackMapTable expansion and re-encoding |
//! | [`hierarchy`] | Cross-module class graph |
//! | [`resolver`] | Scanning inputs, fetching platform stubs |
//! | [`families`] | The traced JDBC type families |
//! | [`marks`] | Which declaring class gets which method traced |
//! | [`rewriter`] | **Method wrapping** and callback holder setup |
//! | [`pipeline`] | [`Instrumenter`], the whole run |
//! | [`runtime`] | Callback trait, proxy normalisation, registry |

pub mod bytecode;
pub mod classfile;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod families;
pub mod hierarchy;
pub mod marks;
pub mod pipeline;
pub mod resolver;
pub mod rewriter;
pub mod runtime;
pub mod source;
pub mod stackmap;

pub use config::{CallbackLocator, ConfigError, InstrumentConfig};
pub use error::{Error, Result};
pub use families::Family;
pub use hierarchy::{Hierarchy, MethodSignature};
pub use marks::MarkTable;
pub use pipeline::{Instrumenter, Module, Summary};
pub use rewriter::Rewriter;
pub use runtime::{FilterTracingCallback, LogTracingCallback, TracingCallback};
pub use source::{DirectorySink, DirectorySource, DirectoryStubSource, MemoryModules, ModuleSource, OutputSink, StubSource};

#[cfg(feature = "jar")]
pub use source::{JarSource, JarStubSource};
