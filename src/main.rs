use std::{fs, path::Path};

use anyhow::Context;
use args::Args;
use getopts::Occur;
use glob::glob;
use leakhook::LeakProfile;

const PROGRAM_DESC: &str = "Visualize leakhook leak listings";
const PROGRAM_NAME: &str = "lh_print";

fn load(path: &Path) -> Result<LeakProfile, anyhow::Error> {
    tracing::info!("found leak listing in {}", path.display());
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    LeakProfile::from_json(&text).with_context(|| format!("parsing {}", path.display()))
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.option(
        "f",
        "file",
        "JSON leak listing (raw or aggregated)",
        "FILE",
        Occur::Optional,
        None,
    );
    args.option(
        "d",
        "dir",
        "Directory holding leakhook*.json listings",
        "DIR",
        Occur::Optional,
        None,
    );
    args.option(
        "t",
        "threshold",
        "Hide call stacks holding less than this percentage of leaked bytes",
        "PERCENT",
        Occur::Optional,
        Some("0".to_string()),
    );

    args.parse_from_cli()?;

    let file: Option<String> = args.optional_value_of("file")?;
    let dir: Option<String> = args.optional_value_of("dir")?;
    let threshold: f64 = args.value_of("threshold")?;

    let mut paths = Vec::new();
    if let Some(file) = file {
        paths.push(Path::new(&file).to_path_buf());
    }
    if let Some(dir) = dir {
        let wildcard = format!("{}/leakhook*.json", dir);
        for path in glob(wildcard.as_str())? {
            paths.push(path?);
        }
    }
    if paths.is_empty() {
        anyhow::bail!("no leak listings given\n{}", args.full_usage());
    }

    // Merge every listing into one profile.
    let mut aggregate_profile = LeakProfile::new();
    for path in paths.iter() {
        aggregate_profile.merge(&load(path)?);
    }

    let mut out = String::new();
    aggregate_profile.fmt_with_threshold(threshold, &mut out)?;
    println!("{}", out);

    Ok(())
}
