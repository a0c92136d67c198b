use untangle::engine::{Engine, EngineError, PipelineConfig};
use untangle::transform::passes::Mappings;
use untangle::transform::{Catalog, Category};

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let matches = Command::new("untangle")
        .version(clap::crate_version!())
        .about("Undo common obfuscations in JVM classes and jars")
        .arg(
            Arg::new("INPUT")
                .help("Jar, zip, or class file to deobfuscate")
                .required_unless_present("list")
                .value_parser(value_parser!(PathBuf))
                .index(1),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Where to write the result (defaults to `<input>-deobf.<ext>`)"),
        )
        .arg(
            Arg::new("transformers")
                .short('t')
                .long("transformers")
                .value_name("NAMES")
                .value_delimiter(',')
                .action(ArgAction::Append)
                .help("Transformers or categories to run, in order (defaults to every category except renaming)"),
        )
        .arg(
            Arg::new("parallel")
                .long("parallel")
                .action(ArgAction::SetTrue)
                .help("Transform classes in parallel where the transformer allows it"),
        )
        .arg(
            Arg::new("no-verify")
                .long("no-verify")
                .action(ArgAction::SetTrue)
                .help("Skip verifying classes before and after the run"),
        )
        .arg(
            Arg::new("discard-invalid")
                .long("discard-invalid")
                .action(ArgAction::SetTrue)
                .help("Write the original bytes of changed classes that no longer verify"),
        )
        .arg(
            Arg::new("strip-signatures")
                .long("strip-signatures")
                .action(ArgAction::SetTrue)
                .help("Remove jar signature files, which rewritten classes invalidate"),
        )
        .arg(
            Arg::new("report")
                .long("report")
                .value_name("JSON")
                .value_parser(value_parser!(PathBuf))
                .help("Write the execution report as JSON"),
        )
        .arg(
            Arg::new("mappings")
                .long("mappings")
                .value_name("TINY")
                .value_parser(value_parser!(PathBuf))
                .help("Tiny (v1 or v2) mappings for `mappings-remapper`"),
        )
        .arg(
            Arg::new("step-budget")
                .long("step-budget")
                .value_name("STEPS")
                .value_parser(value_parser!(usize))
                .help("Instructions the sandboxed interpreter may run per evaluation"),
        )
        .arg(
            Arg::new("heap-budget")
                .long("heap-budget")
                .value_name("SLOTS")
                .value_parser(value_parser!(usize))
                .help("Array elements and string characters the sandboxed interpreter may allocate per evaluation"),
        )
        .arg(
            Arg::new("list")
                .long("list")
                .action(ArgAction::SetTrue)
                .help("List the available transformers and exit"),
        )
        .get_matches();

    let catalog = Catalog::default();
    if matches.get_flag("list") {
        for transformer in catalog.iter() {
            println!(
                "{:<24} {:<22} {}",
                transformer.name(),
                transformer.category().name(),
                transformer.description()
            );
        }
        return Ok(());
    }

    let config = pipeline_config(&matches)?;
    let input = matches
        .get_one::<PathBuf>("INPUT")
        .ok_or_else(|| EngineError::Config(String::from("no input given")))?;
    let output = matches
        .get_one::<PathBuf>("output")
        .cloned()
        .unwrap_or_else(|| default_output(input));

    log::info!("Deobfuscating '{}'", input.display());
    let report = Engine::new(&catalog, config).run_file(input, &output)?;
    log::info!("Wrote '{}'", output.display());

    if let Some(report_path) = matches.get_one::<PathBuf>("report") {
        fs::write(report_path, report.to_json()?)?;
        log::info!("Wrote report '{}'", report_path.display());
    }

    let summary = &report.summary;
    println!(
        "{} classes loaded ({} malformed), {} changed, {} failed transforms, {} valid, {} invalid",
        summary.loaded,
        summary.malformed,
        summary.changed,
        summary.failed,
        summary.valid,
        summary.invalid
    );
    Ok(())
}

fn pipeline_config(matches: &ArgMatches) -> Result<PipelineConfig, EngineError> {
    let selectors: Vec<String> = match matches.get_many::<String>("transformers") {
        Some(names) => names
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
            .collect(),
        None => Category::ALL
            .iter()
            .filter(|category| **category != Category::Renaming)
            .map(|category| category.name().to_owned())
            .collect(),
    };

    let mut config = PipelineConfig::new(selectors);
    config.parallel = matches.get_flag("parallel");
    config.verify = !matches.get_flag("no-verify");
    config.discard_invalid = matches.get_flag("discard-invalid");
    config.strip_signatures = matches.get_flag("strip-signatures");
    if let Some(steps) = matches.get_one::<usize>("step-budget") {
        config.settings.step_budget = *steps;
    }
    if let Some(slots) = matches.get_one::<usize>("heap-budget") {
        config.settings.heap_budget = *slots;
    }
    if let Some(path) = matches.get_one::<PathBuf>("mappings") {
        let mappings = Mappings::from_file(path)
            .map_err(|err| EngineError::Config(format!("{}: {}", path.display(), err)))?;
        config.settings.mappings = Some(Arc::new(mappings));
    }
    Ok(config)
}

/// `foo.jar` becomes `foo-deobf.jar`
fn default_output(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("output"));
    let file_name = match input.extension() {
        Some(extension) => format!("{}-deobf.{}", stem, extension.to_string_lossy()),
        None => format!("{}-deobf", stem),
    };
    input.with_file_name(file_name)
}
