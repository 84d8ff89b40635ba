#![forbid(unsafe_code)]

use pnp_conformance::{HarnessConfig, SuiteReport, run_all_core_suites, set_equivalence_log_path};
use pnp_runtime::set_evaluation_log_path;
use serde::Serialize;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Serialize)]
struct SuiteSummary {
    suite: String,
    case_count: usize,
    pass_count: usize,
    failures: Vec<String>,
}

#[derive(Debug, Serialize)]
struct GateSummary {
    status: &'static str,
    mode: &'static str,
    equivalence_log: String,
    evaluation_log: Option<String>,
    suites: Vec<SuiteSummary>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("run_equivalence_gate failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut log_path: Option<PathBuf> = None;
    let mut evaluation_log: Option<PathBuf> = None;
    let mut hardened = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--log-path" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--log-path requires a value".to_string())?;
                log_path = Some(PathBuf::from(value));
            }
            "--evaluation-log-path" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--evaluation-log-path requires a value".to_string())?;
                evaluation_log = Some(PathBuf::from(value));
            }
            "--hardened" => hardened = true,
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p pnp-conformance --bin run_equivalence_gate -- [--log-path <path>] [--evaluation-log-path <path>] [--hardened]"
                );
                return Ok(());
            }
            unknown => return Err(format!("unknown argument: {unknown}")),
        }
    }

    let ts_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis());
    let log_path = log_path.unwrap_or_else(|| {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../artifacts/logs")
            .join(format!("equivalence_gate_{ts_millis}.jsonl"))
    });
    set_equivalence_log_path(Some(log_path.clone()));
    set_evaluation_log_path(evaluation_log.clone());

    let cfg = HarnessConfig {
        strict_mode: !hardened,
        ..HarnessConfig::default_paths()
    };
    let suites = run_all_core_suites(&cfg)?;

    let status = if suites.iter().all(SuiteReport::all_passed) {
        "pass"
    } else {
        "fail"
    };
    let summary = GateSummary {
        status,
        mode: cfg.mode().as_str(),
        equivalence_log: log_path.display().to_string(),
        evaluation_log: evaluation_log.map(|path| path.display().to_string()),
        suites: suites.into_iter().map(summarize_suite).collect(),
    };

    let summary_json = serde_json::to_string_pretty(&summary)
        .map_err(|err| format!("failed serializing summary: {err}"))?;
    println!("{summary_json}");

    if status == "fail" {
        std::process::exit(2);
    }
    Ok(())
}

fn summarize_suite(report: SuiteReport) -> SuiteSummary {
    SuiteSummary {
        suite: report.suite.to_string(),
        case_count: report.case_count,
        pass_count: report.pass_count,
        failures: report.failures,
    }
}
