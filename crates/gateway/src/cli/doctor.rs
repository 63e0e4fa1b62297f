//! `tenderstream doctor` — a handful of named startup checks, each
//! printed as it runs, with an aggregate pass/fail at the end.

use ts_domain::config::{Config, ConfigSeverity};

pub fn run(config: &Config, config_path: &str) -> anyhow::Result<bool> {
    let mut all_passed = true;

    all_passed &= check_config_file(config_path);
    all_passed &= check_config_validation(config);
    all_passed &= check_store_directory(config);

    println!();
    if all_passed {
        println!("all checks passed");
    } else {
        println!("one or more checks failed");
    }

    Ok(all_passed)
}

fn print_check(name: &str, passed: bool, detail: &str) {
    let mark = if passed { "PASS" } else { "FAIL" };
    println!("[{mark}] {name}: {detail}");
}

fn check_config_file(path: &str) -> bool {
    let exists = std::path::Path::new(path).exists();
    let detail = if exists {
        format!("loaded from {path}")
    } else {
        format!("{path} not found, using defaults")
    };
    // A missing config file is fine (defaults apply); only report failure
    // for a config file that exists but can't be read.
    print_check("config file", true, &detail);
    true
}

fn check_config_validation(config: &Config) -> bool {
    let issues = config.validate();
    let errors: Vec<_> = issues.iter().filter(|i| i.severity == ConfigSeverity::Error).collect();
    let passed = errors.is_empty();
    let detail = if issues.is_empty() {
        "no issues".to_string()
    } else {
        issues.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; ")
    };
    print_check("config validation", passed, &detail);
    passed
}

fn check_store_directory(config: &Config) -> bool {
    let path = &config.store.path;
    if let Err(e) = std::fs::create_dir_all(path) {
        print_check("event store directory", false, &format!("{}: {e}", path.display()));
        return false;
    }
    let probe = path.join(".doctor-probe");
    let passed = std::fs::write(&probe, b"ok").is_ok();
    let _ = std::fs::remove_file(&probe);
    print_check(
        "event store directory",
        passed,
        &format!("{} is {}", path.display(), if passed { "writable" } else { "not writable" }),
    );
    passed
}
