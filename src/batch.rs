//! Batch driver.
//!
//! A batch owns the location cache. Classes are converted in parallel and
//! may touch the same cache group; the cache classes are only generated
//! after every conversion has returned.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::cache::{CacheClass, LocationCache};
use crate::convert::{Converted, convert};
use crate::error::{BatchError, ConvertError};
use crate::hierarchy::ClassHierarchy;
use crate::naming;
use crate::registry::Registry;

/// Shared state of one batch: the handler registry, the location cache
/// and the hierarchy used for frame computation.
pub struct BatchContext {
    registry: Registry,
    cache: LocationCache,
    hierarchy: Box<dyn ClassHierarchy>,
    in_flight: Arc<AtomicUsize>,
}

/// Held for the duration of one conversion.
#[derive(Debug)]
pub struct ConversionTicket {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for ConversionTicket {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl BatchContext {
    pub fn new<H: ClassHierarchy + 'static>(registry: Registry, hierarchy: H) -> Self {
        Self {
            registry,
            cache: LocationCache::new(),
            hierarchy: Box::new(hierarchy),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cache(&self) -> &LocationCache {
        &self.cache
    }

    pub fn hierarchy(&self) -> &dyn ClassHierarchy {
        self.hierarchy.as_ref()
    }

    pub fn begin(&self) -> ConversionTicket {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        ConversionTicket {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Conversions currently holding a ticket.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Generates the cache classes, keyed by group.
    ///
    /// # Panics
    ///
    /// If a conversion ticket is still alive. Emitting then would drop
    /// records that rewritten code already indexes.
    pub fn finish(self) -> Result<BTreeMap<String, CacheClass>, ConvertError> {
        let outstanding = self.in_flight();
        assert!(
            outstanding == 0,
            "cache classes emitted while {outstanding} conversions are in flight"
        );
        let BatchContext {
            cache, hierarchy, ..
        } = self;
        cache.emit(hierarchy.as_ref())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Stop at the first failed class and write nothing.
    pub fail_fast: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self { fail_fast: true }
    }
}

#[derive(Debug)]
pub struct Failure {
    pub path: PathBuf,
    pub error: ConvertError,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub converted: usize,
    pub rewritten: usize,
    pub unchanged: usize,
    pub call_sites: usize,
    /// Internal names of the emitted cache classes.
    pub cache_classes: Vec<String>,
    pub failures: Vec<Failure>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Every `.class` file below `root` except previously generated cache
/// classes, in path order.
pub fn discover(root: &Path) -> Result<Vec<PathBuf>, BatchError> {
    let pattern = format!("{}/**/*.class", glob::Pattern::escape(&root.to_string_lossy()));
    let mut paths = Vec::new();
    for entry in glob::glob(&pattern)? {
        let path = entry?;
        let is_cache = path
            .file_stem()
            .is_some_and(|stem| naming::is_cache_class(&stem.to_string_lossy()));
        if is_cache {
            debug!(path = %path.display(), "skipping generated cache class");
            continue;
        }
        paths.push(path);
    }
    paths.sort();
    Ok(paths)
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), BatchError> {
    let io = |source| BatchError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io)?;
    }
    fs::write(path, bytes).map_err(io)
}

/// Converts every class below `input` and writes the results, mirrored,
/// below `output`, together with one cache class per group.
///
/// A class that fails to convert is reported in [`BatchReport::failures`].
/// In fail-fast mode any failure means nothing is written; otherwise failed
/// classes are left out of the output and everything else is written.
pub fn weave(
    ctx: BatchContext,
    input: &Path,
    output: &Path,
    options: &BatchOptions,
) -> Result<BatchReport, BatchError> {
    let paths = discover(input)?;
    info!(input = %input.display(), classes = paths.len(), "weaving");

    let inputs = paths
        .into_par_iter()
        .map(|path| match fs::read(&path) {
            Ok(bytes) => Ok((path, bytes)),
            Err(source) => Err(BatchError::Read { path, source }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let abort = AtomicBool::new(false);
    let results: Vec<(PathBuf, Result<Converted, ConvertError>)> = inputs
        .into_par_iter()
        .filter_map(|(path, bytes)| {
            if options.fail_fast && abort.load(Ordering::Relaxed) {
                return None;
            }
            let result = convert(&bytes, &ctx);
            if result.is_err() {
                abort.store(true, Ordering::Relaxed);
            }
            Some((path, result))
        })
        .collect();

    let mut report = BatchReport::default();
    let mut written = Vec::new();
    for (path, result) in results {
        match result {
            Ok(converted) => {
                report.converted += 1;
                report.call_sites += converted.call_sites;
                if converted.is_rewritten() {
                    report.rewritten += 1;
                } else {
                    report.unchanged += 1;
                }
                written.push((path, converted));
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "conversion failed");
                report.failures.push(Failure { path, error });
            }
        }
    }
    if options.fail_fast && !report.is_success() {
        return Ok(report);
    }

    let caches = ctx.finish()?;
    let relative_to_input = |path: &Path| path.strip_prefix(input).map(Path::to_path_buf);

    // Cache classes go next to the first class file of their group. Groups
    // whose classes all failed get no cache class.
    let mut cache_dirs: BTreeMap<&str, Option<PathBuf>> = BTreeMap::new();
    for (path, converted) in &written {
        if let Some(group) = converted.group.as_deref() {
            cache_dirs
                .entry(group)
                .or_insert_with(|| relative_to_input(path).ok());
        }
    }

    for (path, converted) in &written {
        let target = match relative_to_input(path) {
            Ok(relative) => output.join(relative),
            Err(_) => output.join(naming::class_file_path(&converted.class_name)),
        };
        if !converted.is_rewritten() && target == *path {
            continue;
        }
        write_file(&target, &converted.bytes)?;
    }
    for (group, cache) in &caches {
        let Some(source) = cache_dirs.get(group.as_str()) else {
            debug!(class = %cache.name, "no class of the group converted, skipping cache class");
            continue;
        };
        let target = match source {
            Some(source) => output.join(naming::cache_file_next_to(source, &cache.name)),
            None => output.join(naming::class_file_path(&cache.name)),
        };
        debug!(class = %cache.name, path = %target.display(), "writing cache class");
        write_file(&target, &cache.bytes)?;
        report.cache_classes.push(cache.name.clone());
    }

    info!(
        converted = report.converted,
        rewritten = report.rewritten,
        unchanged = report.unchanged,
        call_sites = report.call_sites,
        cache_classes = report.cache_classes.len(),
        failures = report.failures.len(),
        "weaving finished"
    );
    Ok(report)
}
