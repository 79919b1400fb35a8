use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use itertools::Itertools;
use tracing::{Level, error, info, warn};

use location_weaver::batch::{BatchContext, BatchOptions, weave};
use location_weaver::hierarchy::ClassPath;
use location_weaver::registry::Registry;

/// Bakes Log4j caller locations into compiled classes.
#[derive(Parser, Debug)]
#[command(name = "location-weaver", version)]
struct Opts {
    /// Root of the compiled classes to weave.
    #[arg(long)]
    input: PathBuf,
    /// Root for rewritten classes and cache classes. May equal --input.
    #[arg(long)]
    output: PathBuf,
    /// Extra directories or jars used to resolve ancestors.
    #[arg(long = "classpath", value_name = "DIR|JAR")]
    classpath: Vec<PathBuf>,
    /// JDK whose `jmods` (or `rt.jar`) resolve platform ancestors.
    #[arg(long, env = "JAVA_HOME", value_name = "JAVA_HOME")]
    jdk: Option<PathBuf>,
    /// Worker threads.
    #[arg(long)]
    jobs: Option<usize>,
    /// Report every failing class instead of stopping at the first.
    #[arg(long)]
    keep_going: bool,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Opts {
    fn level(&self) -> Level {
        if self.quiet {
            return Level::ERROR;
        }
        match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

fn run(opts: &Opts) -> anyhow::Result<bool> {
    if let Some(jobs) = opts.jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build_global()
            .context("failed to start worker pool")?;
    }

    let roots: Vec<&PathBuf> = std::iter::once(&opts.input).chain(&opts.classpath).collect();
    let mut classpath = ClassPath::with_roots(&roots)
        .with_context(|| format!("failed to open classpath {}", roots.iter().map(|p| p.display()).join(":")))?;
    if let Some(jdk) = &opts.jdk {
        let archives = classpath
            .add_jdk(jdk)
            .with_context(|| format!("failed to open JDK at {}", jdk.display()))?;
        if archives == 0 {
            warn!(jdk = %jdk.display(), "no jmods or rt.jar found, platform classes beyond java.lang will not resolve");
        }
    }
    let ctx = BatchContext::new(Registry::log4j_api(), classpath);
    let options = BatchOptions {
        fail_fast: !opts.keep_going,
    };

    let report = weave(ctx, &opts.input, &opts.output, &options).with_context(|| {
        format!(
            "failed to weave {} into {}",
            opts.input.display(),
            opts.output.display()
        )
    })?;

    for failure in &report.failures {
        let chain = std::iter::successors(Some(&failure.error as &dyn std::error::Error), |err| {
            err.source()
        })
        .join(": ");
        error!(path = %failure.path.display(), "{chain}");
    }
    if !report.is_success() {
        error!(
            failed = report.failures.len(),
            "weaving failed{}",
            if options.fail_fast { ", nothing written" } else { "" }
        );
        return Ok(false);
    }
    info!(
        rewritten = report.rewritten,
        call_sites = report.call_sites,
        caches = %report.cache_classes.iter().join(", "),
        "done"
    );
    Ok(true)
}

fn main() -> ExitCode {
    let opts = Opts::parse();
    tracing_subscriber::fmt()
        .with_max_level(opts.level())
        .with_writer(std::io::stderr)
        .init();

    match run(&opts) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
