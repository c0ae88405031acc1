use std::env;
use std::time::Instant;

use jdbc_tracing::classfile::ClassFile;
use jdbc_tracing::{InstrumentConfig, Instrumenter, JarSource, JarStubSource, ModuleSource};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let jar_path = args.next().expect("usage: jar_rewrite_bench JAR_PATH [STUB_JAR]");
    let stub_path = args.next();
    let jar = JarSource::open(&jar_path)?;

    let mut total_bytes: u64 = 0;
    let mut round_tripped: u64 = 0;
    let mut failed: u64 = 0;
    let mut class_files: u64 = 0;

    let start = Instant::now();
    for name in jar.module_names()? {
        if !name.ends_with(".class") {
            continue;
        }
        class_files += 1;
        let bytes = jar.read_module(&name)?;
        total_bytes += bytes.len() as u64;
        match ClassFile::parse(&bytes).and_then(|c| c.to_bytes()) {
            Ok(_) => round_tripped += 1,
            Err(_) => failed += 1,
        }
    }
    let dur = start.elapsed();

    let secs = dur.as_secs_f64();
    let mb = total_bytes as f64 / (1024.0 * 1024.0);
    let ns_per = if round_tripped > 0 {
        (dur.as_nanos() as f64) / (round_tripped as f64)
    } else {
        0.0
    };
    let mb_per_s = if secs > 0.0 { mb / secs } else { 0.0 };

    println!("jar_path={}", jar_path);
    println!("class_files={}", class_files);
    println!("round_tripped={} failed={}", round_tripped, failed);
    println!("total_mb={:.3}", mb);
    println!("parse_write_time_ms={:.3}", secs * 1000.0);
    println!("ns_per_class={:.1}", ns_per);
    println!("mb_per_s={:.2}", mb_per_s);

    if let Some(stub_path) = stub_path {
        let stubs = JarStubSource::open(&stub_path)?;
        let start = Instant::now();
        let (modules, summary) = Instrumenter::new(InstrumentConfig::default()).instrument_with_summary(&jar, &stubs)?;
        let dur = start.elapsed();
        println!("stub_jar={}", stub_path);
        println!("library_classes={}", summary.library_classes);
        println!("marks={}", summary.marks);
        println!("methods_rewritten={}", summary.methods_rewritten);
        println!("modules_rewritten={}", modules.len());
        println!("instrument_time_ms={:.3}", dur.as_secs_f64() * 1000.0);
    }

    Ok(())
}
