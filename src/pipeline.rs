//! End-to-end instrumentation of a set of modules.

use tracing::{debug, info};

use crate::config::InstrumentConfig;
use crate::error::Error;
use crate::marks::{self, MarkTable};
use crate::resolver::{self, ScannedClass};
use crate::rewriter::Rewriter;
use crate::source::{ModuleSource, OutputSink, StubSource};

/// A rewritten module ready to be written out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Counts from the last [`Instrumenter::instrument`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub classes: usize,
    pub library_classes: usize,
    pub marks: usize,
    pub methods_rewritten: usize,
    pub modules_written: usize,
}

pub struct Instrumenter {
    config: InstrumentConfig,
}

impl Instrumenter {
    pub fn new(config: InstrumentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    /// Builds the hierarchy and the mark table without rewriting anything.
    pub fn plan(&self, source: &dyn ModuleSource, stubs: &dyn StubSource) -> Result<(Vec<ScannedClass>, MarkTable, Summary), Error> {
        let mut scan = resolver::scan(source)?;
        let library = resolver::resolve_platform_closure(&mut scan.hierarchy, &self.config.closure_seeds(), stubs)?;
        let table = marks::assign(&scan.hierarchy, &self.config.families, &self.config.root)?;
        let summary = Summary {
            classes: scan.classes.len(),
            library_classes: library,
            marks: table.len(),
            ..Summary::default()
        };
        Ok((scan.classes, table, summary))
    }

    /// Rewrites every class with marks and augments the callback holder.
    /// Only modified modules are returned; any failure aborts the whole run.
    pub fn instrument(&self, source: &dyn ModuleSource, stubs: &dyn StubSource) -> Result<Vec<Module>, Error> {
        self.instrument_with_summary(source, stubs).map(|(modules, _)| modules)
    }

    pub fn instrument_with_summary(
        &self,
        source: &dyn ModuleSource,
        stubs: &dyn StubSource,
    ) -> Result<(Vec<Module>, Summary), Error> {
        let (classes, table, mut summary) = self.plan(source, stubs)?;
        info!(
            classes = summary.classes,
            library = summary.library_classes,
            marks = summary.marks,
            "hierarchy resolved"
        );

        let locator = &self.config.locator;
        let rewriter = Rewriter::new(locator);
        let mut modules = Vec::new();
        for ScannedClass { module, name, mut class_file } in classes {
            let marks = table.marks_for(&name);
            let is_holder = name == locator.holder;
            if marks.is_none() && !is_holder {
                continue;
            }
            if let Some(marks) = marks {
                summary.methods_rewritten +=
                    rewriter.rewrite_class(&mut class_file, marks).map_err(|e| Error::from(e).in_module(&module))?;
            }
            if is_holder {
                rewriter.augment_holder(&mut class_file).map_err(|e| Error::from(e).in_module(&module))?;
            }
            let bytes = class_file.to_bytes().map_err(|e| Error::from(e).in_module(&module))?;
            debug!(module = %module, "instrumented");
            modules.push(Module { name: module, bytes });
        }
        summary.modules_written = modules.len();
        info!(methods = summary.methods_rewritten, modules = summary.modules_written, "instrumentation finished");
        Ok((modules, summary))
    }

    /// Instruments everything first, then writes each module once.
    /// Returns the number of modules written.
    pub fn run(&self, source: &dyn ModuleSource, stubs: &dyn StubSource, sink: &mut dyn OutputSink) -> Result<usize, Error> {
        let modules = self.instrument(source, stubs)?;
        for module in &modules {
            sink.write_module(&module.name, &module.bytes).map_err(|e| Error::from(e).in_module(&module.name))?;
        }
        Ok(modules.len())
    }
}
