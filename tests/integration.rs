use std::{fs, path::Path, path::PathBuf, process::Command, process::Output};

fn run_bin(args: &[&str]) -> Output {
    let bin = PathBuf::from(env!("CARGO_BIN_EXE_ctmixtures"));
    Command::new(bin)
        .args(args)
        .output()
        .expect("failed to execute command")
}

fn assert_success(args: &[&str]) {
    let output = run_bin(args);

    let stdout_str =
        std::str::from_utf8(&output.stdout).expect("failed to convert stdout to string");
    let stderr_str =
        std::str::from_utf8(&output.stderr).expect("failed to convert stderr to string");

    assert!(
        output.status.success(),
        "failed to run binary with {args:?}\nstdout:\n{stdout_str}\nstderr:\n{stderr_str}\n"
    );
}

fn setup_dir(name: &str) -> PathBuf {
    let test_dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join(name);

    fs::remove_dir_all(&test_dir).ok();
    fs::create_dir(&test_dir).expect("failed to create test directory");

    let config_contents = String::new()
        + "[population]\n"
        + "size = 9\n"
        + "num_loci = 2\n"
        + "max_init_traits = 5\n"
        + "topology = { kind = \"square_lattice\" }\n"
        + "\n"
        + "[model]\n"
        + "rules = [ { rule = \"neutral\", weight = 1.0 }, { rule = \"conformist\", weight = 1.0 } ]\n"
        + "conformism_strength = 0.5\n"
        + "innovation_rate = 1.0\n"
        + "\n"
        + "[sampling]\n"
        + "end_tick = 200\n"
        + "kandler_interval = 2\n"
        + "ta_durations = [ 1, 2 ]\n"
        + "sample_sizes = [ 3, 5 ]\n"
        + "snapshot_interval = 5\n"
        + "slatkin_reps = 200\n";

    fs::write(test_dir.join("config.toml"), config_contents).expect("failed to write config file");

    test_dir
}

fn count_lines(file: &Path) -> usize {
    fs::read_to_string(file)
        .expect("failed to read table")
        .lines()
        .count()
}

#[test]
fn basic_workflow() {
    let test_dir = setup_dir("basic_workflow");
    let test_dir_str = test_dir
        .to_str()
        .expect("failed to convert test directory to string");

    assert_success(&[
        "--sim-dir",
        test_dir_str,
        "run",
        "--experiment",
        "workflow",
        "--seed",
        "7",
    ]);
    assert_success(&[
        "--sim-dir",
        test_dir_str,
        "run",
        "--experiment",
        "workflow",
        "--popsize",
        "16",
        "--periodic",
        "1",
        "--simulationendtime",
        "300",
        "--anticonformismstrength",
        "0.2",
    ]);

    for run in ["run-0000", "run-0001"] {
        assert!(test_dir.join(run).join("samples.msgpack").is_file());
        assert!(test_dir.join(run).join("simulation.json").is_file());
    }
    let summary = fs::read_to_string(test_dir.join("run-0000").join("simulation.json"))
        .expect("failed to read simulation record");
    assert!(summary.contains("\"seed\": 7"));
    assert!(summary.contains("urn:uuid:"));

    assert_success(&["--sim-dir", test_dir_str, "export"]);

    // Run 0 snapshots at ticks 45, 90, 135 and 180; run 1 at 80, 160 and 240.
    assert_eq!(count_lines(&test_dir.join("simulation-data.csv")), 1 + 2);
    assert_eq!(count_lines(&test_dir.join("population-data.csv")), 1 + 5 + 4);
    assert_eq!(count_lines(&test_dir.join("sampled-data.csv")), 1 + 2 * (5 + 4));
    assert_eq!(count_lines(&test_dir.join("tasampled-data.csv")), 1 + 2 * (2 * 2));

    assert_success(&["--sim-dir", test_dir_str, "clean"]);
    assert!(!test_dir.join("run-0000").exists());
    assert!(!test_dir.join("population-data.csv").exists());
    assert!(test_dir.join("config.toml").exists());

    fs::remove_dir_all(&test_dir).ok();
}

#[test]
fn invalid_configuration_fails() {
    let test_dir = setup_dir("invalid_configuration");
    let test_dir_str = test_dir
        .to_str()
        .expect("failed to convert test directory to string");

    let not_square = run_bin(&[
        "--sim-dir",
        test_dir_str,
        "run",
        "--experiment",
        "invalid",
        "--popsize",
        "10",
    ]);
    assert!(!not_square.status.success());

    let bad_flag = run_bin(&[
        "--sim-dir",
        test_dir_str,
        "run",
        "--experiment",
        "invalid",
        "--periodic",
        "2",
    ]);
    assert!(!bad_flag.status.success());

    let missing = run_bin(&[
        "--sim-dir",
        test_dir_str,
        "run",
        "--experiment",
        "invalid",
        "--configuration",
        "missing.toml",
    ]);
    assert!(!missing.status.success());

    assert!(!test_dir.join("run-0000").exists());

    fs::remove_dir_all(&test_dir).ok();
}
