use std::env;
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use jvmti_probes::matcher::{ClassIndex, ClassMatcher, MethodMatcher};
use jvmti_probes::registry::ClassRetransformer;
use jvmti_probes::rule::Rule;
use jvmti_probes::runtime::ProbeTable;
use jvmti_probes::trace::TraceDetails;
use jvmti_probes::transformer::{ClassFilter, CustomClassTransformer, LoaderKind};
use zip::ZipArchive;

/// Runs every class in a jar through the transformer with a single rule
/// probing all methods (or only those named METHOD_NAME).
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let jar_path = args.next().ok_or("usage: jar_transform_bench JAR_PATH [METHOD_NAME]")?;
    let method_matcher = match args.next() {
        Some(name) => MethodMatcher::name(&name),
        None => MethodMatcher::Any,
    };

    let local = Arc::new(ClassRetransformer::new("local"));
    local.set_rules(vec![Rule::new(ClassMatcher::Any, method_matcher, TraceDetails::default_trace())])?;
    let probes = Arc::new(ProbeTable::new());
    let transformer = CustomClassTransformer::new(
        local,
        Arc::new(ClassRetransformer::new("remote")),
        Arc::new(ClassIndex::new()),
        probes.clone(),
        ClassFilter::default(),
    );

    let file = File::open(&jar_path)?;
    let mut zip = ZipArchive::new(file)?;

    let mut total_bytes: u64 = 0;
    let mut output_bytes: u64 = 0;
    let mut class_files: u64 = 0;
    let mut rewritten: u64 = 0;

    let start = Instant::now();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(name) = entry.name().strip_suffix(".class").map(str::to_owned) else {
            continue;
        };
        class_files += 1;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        total_bytes += bytes.len() as u64;
        if let Some(out) = transformer.transform_or_skip(LoaderKind::Application, Some(&name), false, &bytes) {
            rewritten += 1;
            output_bytes += out.len() as u64;
        }
    }
    let dur = start.elapsed();

    let secs = dur.as_secs_f64();
    let mb = total_bytes as f64 / (1024.0 * 1024.0);
    let ns_per = if class_files > 0 { (dur.as_nanos() as f64) / (class_files as f64) } else { 0.0 };
    let mb_per_s = if secs > 0.0 { mb / secs } else { 0.0 };
    let stats = transformer.stats();

    println!("jar_path={}", jar_path);
    println!("class_files={}", class_files);
    println!(
        "inspected={} matched={} rewritten={} failed={}",
        stats.inspected, stats.matched, rewritten, stats.failed
    );
    println!("probes={}", probes.len());
    println!("total_mb={:.3} output_mb={:.3}", mb, output_bytes as f64 / (1024.0 * 1024.0));
    println!("transform_time_ms={:.3}", secs * 1000.0);
    println!("ns_per_class={:.1}", ns_per);
    println!("mb_per_s={:.2}", mb_per_s);

    Ok(())
}
