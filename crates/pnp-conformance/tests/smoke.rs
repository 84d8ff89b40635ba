use std::path::Path;

use pnp_conformance::{
    HarnessConfig, run_all_core_suites, run_equivalence_suite, run_error_parity_suite, run_smoke,
};

#[test]
fn smoke_report_is_stable() {
    let cfg = HarnessConfig::default_paths();
    let report = run_smoke(&cfg);
    assert_eq!(report.suite, "smoke");
    assert!(report.fixture_count >= 3);
    assert!(report.strict_mode);

    let fixture_path = cfg.fixture_root.join("equivalence_cases.json");
    assert!(Path::new(&fixture_path).exists());
}

#[test]
fn core_conformance_suites_pass() {
    let cfg = HarnessConfig::default_paths();
    let suites = run_all_core_suites(&cfg).expect("core suites should execute");
    assert_eq!(suites.len(), 3);

    for suite in suites {
        assert!(suite.case_count > 0, "suite {} has no cases", suite.suite);
        assert!(
            suite.all_passed(),
            "suite {} failed with {:?}",
            suite.suite,
            suite.failures
        );
    }
}

#[test]
fn hardened_mode_verifies_digests_and_still_agrees() {
    let cfg = HarnessConfig {
        strict_mode: false,
        workers: 1,
        ..HarnessConfig::default_paths()
    };
    for suite in [
        run_equivalence_suite(&cfg).expect("equivalence suite"),
        run_error_parity_suite(&cfg).expect("error parity suite"),
    ] {
        assert!(
            suite.all_passed(),
            "suite {} failed with {:?}",
            suite.suite,
            suite.failures
        );
    }
}

#[test]
fn missing_fixture_root_is_reported() {
    let cfg = HarnessConfig {
        fixture_root: std::env::temp_dir().join("pnp_conformance_missing_fixtures"),
        ..HarnessConfig::default_paths()
    };
    let err = run_equivalence_suite(&cfg).expect_err("no fixtures");
    assert!(err.contains("failed reading"), "{err}");
    assert_eq!(run_smoke(&cfg).fixture_count, 0);
}
