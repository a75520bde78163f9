use anyhow::bail;
use clap::Parser;
use evresolver::debuginfo_store::{ChainLocator, DebuginfodLocator, LocalLocator};
use evresolver::options::ProfileOptions;
use evresolver::pipeline::{CancelToken, LoadProgress, NoSession, ProfileLoader, ProgressSink};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "evresolver",
    about = "Resolve the samples of a recorded trace into symbolized stacks"
)]
struct Args {
    /// Trace file, optionally gzip compressed
    #[arg(value_name = "TRACE")]
    trace: PathBuf,

    /// Processes to load; the first one is the main process
    #[arg(value_name = "PID", required = true, num_args = 1..)]
    pids: Vec<u32>,

    /// Directory searched for binaries and symbol files, may be repeated
    #[arg(short, long = "search-path", value_name = "DIR")]
    search_paths: Vec<PathBuf>,

    /// Bincode-encoded options file
    #[arg(short, long, value_name = "FILE")]
    options: Option<PathBuf>,

    /// Keep kernel frames and samples
    #[arg(long)]
    include_kernel: bool,

    /// Worker threads used for sample processing
    #[arg(short, long)]
    cores: Option<usize>,
}

impl Args {
    fn profile_options(&self) -> anyhow::Result<ProfileOptions> {
        let mut options = match &self.options {
            Some(path) => ProfileOptions::read_from(path)?,
            None => ProfileOptions::default(),
        };
        options
            .binary_search_paths
            .extend(self.search_paths.iter().cloned());
        if self.include_kernel {
            options.include_kernel_events = true;
        }
        if let Some(cores) = self.cores {
            options.cpu_core_limit = cores;
        }
        options.validate()?;
        Ok(options)
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    colog::init();

    let args = Args::parse();
    let options = args.profile_options()?;
    log::info!(
        "Using {} cores, {} search paths",
        options.cpu_core_limit,
        options.binary_search_paths.len()
    );

    let local = LocalLocator::new(options.binary_search_paths.clone());
    let debuginfod = if options.debuginfod_urls.is_empty() {
        DebuginfodLocator::with_default_server(options.fetch_timeout)?
    } else {
        let cache_dir = options
            .symbol_cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("evresolver-debuginfod"));
        DebuginfodLocator::new(&options.debuginfod_urls, cache_dir, options.fetch_timeout)?
    };
    let locator = Arc::new(ChainLocator::new(local, debuginfod));

    let progress: Arc<dyn ProgressSink> = Arc::new(|p: LoadProgress| {
        log::debug!("{}: {}/{}", p.stage, p.current, p.total);
    });
    let loader = ProfileLoader::new(options, locator, NoSession);
    let profile = match loader
        .load_trace_file(&args.trace, &args.pids, progress, CancelToken::new())
        .await
    {
        Some(profile) => profile,
        None => bail!("Failed to load {}", args.trace.display()),
    };

    println!("Total weight: {:.3} ms", ms(profile.total_weight));
    println!();
    println!("Top functions (exclusive / inclusive ms):");
    for function in profile.top_functions(25) {
        println!(
            "  {:>12.3} {:>12.3}  {}",
            ms(function.exclusive_weight),
            ms(function.weight),
            function.function.name
        );
    }
    println!();
    println!("Top modules (ms):");
    for (image, weight) in profile.top_modules(10) {
        println!("  {:>12.3}  {}", ms(weight), image.module_name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trace_and_pids() {
        let args = Args::try_parse_from([
            "evresolver",
            "trace.bin.gz",
            "10",
            "20",
            "--search-path",
            "/a",
            "-s",
            "/b",
            "--include-kernel",
            "--cores",
            "2",
        ])
        .unwrap();
        assert_eq!(args.trace, PathBuf::from("trace.bin.gz"));
        assert_eq!(args.pids, vec![10, 20]);

        let options = args.profile_options().unwrap();
        assert_eq!(
            options.binary_search_paths,
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
        assert!(options.include_kernel_events);
        assert_eq!(options.cpu_core_limit, 2);
    }

    #[test]
    fn requires_a_pid() {
        assert!(Args::try_parse_from(["evresolver", "trace.bin"]).is_err());
        assert!(Args::try_parse_from(["evresolver", "trace.bin", "abc"]).is_err());
    }

    #[test]
    fn rejects_zero_cores() {
        let args = Args::try_parse_from(["evresolver", "trace.bin", "1", "--cores", "0"]).unwrap();
        assert!(args.profile_options().is_err());
    }
}
