extern crate page_snoop;
extern crate simplelog;

#[macro_use]
extern crate log;

use std::env;
use std::path::{Path, PathBuf};

use chrono::Utc;
use page_snoop::maps::get_regions;
use page_snoop::statistics::{log_analytics, page_analytics};
use page_snoop::{page_size, TraceConfig, TraceError, Tracer};
use simplelog::*;

const DEFAULT_CAPACITY: usize = 64;
const DEFAULT_OUTPUT: &str = "page_snoop.out";
const DEFAULT_WORKLOAD_PAGES: usize = 256;

fn log_level() -> LevelFilter {
    match env::var("PAGE_SNOOP_LOG").as_ref().map(|s| s.as_str()) {
        Ok("error") => LevelFilter::Error,
        Ok("warn") => LevelFilter::Warn,
        Ok("info") => LevelFilter::Info,
        Ok("trace") => LevelFilter::Trace,
        _ => LevelFilter::Debug,
    }
}

fn parse_arg<T: std::str::FromStr>(args: &[String], idx: usize, name: &str, default: T) -> T {
    match args.get(idx) {
        None => default,
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                error!("Can't parse {} from {:?}", name, raw);
                std::process::exit(2);
            }
        },
    }
}

/// Touch every other page of `buf` so the trace has something to find.
fn workload(buf: &mut [u8], page_size: usize) {
    for offset in (0..buf.len()).step_by(2 * page_size) {
        unsafe { std::ptr::write_volatile(buf.as_mut_ptr().add(offset), 1) };
    }
}

fn run(capacity: usize, output: &Path, pages: usize) -> Result<(), TraceError> {
    let page_size = page_size();
    let mut buf = vec![0u8; pages * page_size];
    let buf_start = buf.as_ptr() as usize;
    info!("Workload at {:#x}-{:#x}", buf_start, buf_start + buf.len());
    let mut tracer = Tracer::new(TraceConfig::default())?;

    let start_time = Utc::now();
    tracer.start(capacity)?;
    workload(&mut buf, page_size);
    tracer.stop()?;
    info!(
        "Traced {} page workload in {} ms",
        pages,
        (Utc::now() - start_time).num_milliseconds()
    );

    let dump_time = Utc::now();
    tracer.dump(output)?;
    info!(
        "Dumped {} slots to {} in {} ms",
        capacity,
        output.display(),
        (Utc::now() - dump_time).num_milliseconds()
    );

    let snapshot = tracer.snapshot()?;
    let regions = get_regions(&tracer.config().maps_path)?;
    log_analytics(&page_analytics(&snapshot, &regions));
    Ok(())
}

fn main() {
    CombinedLogger::init(vec![TermLogger::new(
        log_level(),
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )])
    .expect("logger initialised twice");

    let args: Vec<String> = env::args().collect();
    let capacity = parse_arg(&args, 1, "capacity", DEFAULT_CAPACITY);
    let output = parse_arg(&args, 2, "output", PathBuf::from(DEFAULT_OUTPUT));
    let pages = parse_arg(&args, 3, "pages", DEFAULT_WORKLOAD_PAGES);
    info!(
        "Tracing with capacity {}, writing {}, workload of {} pages",
        capacity,
        output.display(),
        pages
    );

    if let Err(e) = run(capacity, &output, pages) {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
}
