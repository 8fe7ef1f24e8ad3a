#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use ct_conformance::{
    CorrectnessResults, CorrectnessTestCase, EchoService, HarnessConfig, ResultsDir,
    channel_pipeline, init_tracing,
};
use ct_corpus::{read_corpus_csv, read_corpus_jsonl};
use ct_types::Corpus;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut corpus_path: Option<PathBuf> = None;
    let mut harness_config: Option<PathBuf> = None;
    let mut target_config: Option<PathBuf> = None;
    let mut results_root: Option<PathBuf> = None;
    let mut key_fields: Vec<String> = Vec::new();
    let mut name: Option<String> = None;
    let mut write_results = false;
    let mut require_green = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--corpus" => {
                let value = args
                    .next()
                    .ok_or("--corpus requires a path (.jsonl or .csv)")?;
                corpus_path = Some(PathBuf::from(value));
            }
            "--harness-config" => {
                let value = args.next().ok_or("--harness-config requires a path")?;
                harness_config = Some(PathBuf::from(value));
            }
            "--target-config" => {
                let value = args.next().ok_or("--target-config requires a path")?;
                target_config = Some(PathBuf::from(value));
            }
            "--results-dir" => {
                let value = args.next().ok_or("--results-dir requires a path")?;
                results_root = Some(PathBuf::from(value));
            }
            "--key-field" => {
                let value = args.next().ok_or("--key-field requires a field name")?;
                key_fields.push(value);
            }
            "--name" => {
                name = Some(args.next().ok_or("--name requires a value")?);
            }
            "--write-results" => {
                write_results = true;
            }
            "--require-green" => {
                require_green = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
    }

    init_tracing();

    let corpus_path = corpus_path.ok_or("--corpus is required (see --help)")?;
    let mut config = match &harness_config {
        Some(path) => HarnessConfig::from_yaml_path(path)?,
        None => HarnessConfig::default_paths(),
    };
    if !key_fields.is_empty() {
        config.key_fields = key_fields;
    }
    if let Some(root) = results_root {
        config.results_root = root;
    }

    let corpus = load_corpus(&corpus_path, &config.key_fields)?;
    let name = name.unwrap_or_else(|| {
        corpus_path
            .file_stem()
            .map_or_else(|| "correctness".to_owned(), |stem| stem.to_string_lossy().into_owned())
    });
    let results_dir = ResultsDir::new(config.results_root.clone());

    let mut case = CorrectnessTestCase::new(name, corpus, config);
    if let Some(path) = &target_config {
        case = case.with_target_config(std::fs::read_to_string(path)?);
    }
    let (sender, receiver, ends) = channel_pipeline();
    let report = case.run(EchoService::new(ends), sender, receiver)?;

    println!(
        "test={} result={} diff_count={} observed={}/{} elapsed_ms={}",
        report.verdict.test_name,
        report.verdict.result.as_str(),
        report.verdict.diff_count,
        report.observed_records,
        report.expected_records,
        report.elapsed_ms
    );
    for failure in &report.failures {
        println!("failure: {failure}");
    }

    if write_results {
        let case_report = results_dir.write_case(&report)?;
        let mut results = CorrectnessResults::new();
        results.add(&report);
        let written = results.write(&results_dir)?;
        println!(
            "wrote report={} results={} markdown={} report_hash={}",
            case_report.display(),
            written.json_path.display(),
            written.markdown_path.display(),
            written.report_hash
        );
    }

    if require_green && !report.is_green() {
        return Err(format!(
            "correctness case {} is not green: {} failure(s)",
            report.verdict.test_name,
            report.failures.len()
        )
        .into());
    }

    Ok(())
}

fn load_corpus(path: &Path, key_fields: &[String]) -> Result<Corpus, Box<dyn std::error::Error>> {
    let corpus = match path.extension().and_then(|ext| ext.to_str()) {
        Some("csv") => read_corpus_csv(path, key_fields)?,
        Some("jsonl" | "ndjson") => read_corpus_jsonl(path, key_fields)?,
        other => {
            return Err(format!(
                "unsupported corpus extension {:?}; expected .jsonl or .csv",
                other.unwrap_or("")
            )
            .into());
        }
    };
    Ok(corpus)
}

fn print_help() {
    println!(
        "ct-correctness-cli\n\
         \n\
         Runs a record corpus through the in-process echo pipeline and reports\n\
         a PASS/FAIL verdict with the diff count.\n\
         \n\
         Usage:\n\
           ct-correctness-cli --corpus <path> [options]\n\
         \n\
         Options:\n\
           --corpus <path>           corpus file (.jsonl or .csv)\n\
           --key-field <name>        field used to derive record keys (repeatable)\n\
           --name <name>             test name (default: corpus file stem)\n\
           --harness-config <path>   YAML harness settings\n\
           --target-config <path>    config text handed to the target\n\
           --results-dir <path>      results root (overrides harness config)\n\
           --write-results           write report, forensic log and summary files\n\
           --require-green           exit non-zero unless the verdict is PASS\n\
           -h, --help                show this help"
    );
}
