use std::process::Command;
use std::str;

// Helper to find the CLI executable
fn get_cli_path() -> String {
    // Assumes the binary is built in debug mode by `cargo test`.
    format!("target/debug/{}", "dpm")
}

#[test]
fn test_cli_help_message() {
    let output = Command::new(get_cli_path())
        .arg("--help")
        .output()
        .expect("Failed to execute --help command");

    assert!(output.status.success(), "CLI --help exited with error: {:?}", output);
    let stdout = str::from_utf8(&output.stdout).expect("stdout is not valid UTF-8");

    assert!(stdout.contains("Usage:"), "Help message should contain 'Usage:'");
    assert!(stdout.contains("pgbn"), "Help message should list the pgbn subcommand");
    assert!(stdout.contains("cpfa"), "Help message should list the cpfa subcommand");
    assert!(stdout.contains("cpgbn"), "Help message should list the cpgbn subcommand");
}

#[test]
fn test_cli_version_message() {
    let output = Command::new(get_cli_path())
        .arg("--version")
        .output()
        .expect("Failed to execute --version command");

    assert!(output.status.success(), "CLI --version exited with error: {:?}", output);
    let stdout = str::from_utf8(&output.stdout).expect("stdout is not valid UTF-8");
    assert!(
        stdout.contains("dpm 0.1.0"),
        "Version output did not contain expected name and version. Output: {}",
        stdout
    );
}

#[test]
fn test_cli_subcommand_help_lists_args() {
    let output = Command::new(get_cli_path())
        .args(["pgbn", "--help"])
        .output()
        .expect("Failed to execute pgbn --help");

    assert!(output.status.success());
    let stdout = str::from_utf8(&output.stdout).expect("stdout is not valid UTF-8");
    assert!(stdout.contains("--train-images"), "Help should mention --train-images");
    assert!(stdout.contains("--z-dims"), "Help should mention --z-dims");
    assert!(stdout.contains("--device"), "Help should mention --device");
}

#[test]
fn test_cli_missing_required_args() {
    // Omit --train-images and the other required paths.
    let output = Command::new(get_cli_path())
        .args(["pgbn", "--train-labels", "dummy-labels-idx1-ubyte"])
        .output()
        .expect("Failed to execute command with missing args");

    assert!(
        !output.status.success(),
        "CLI should fail when required paths are missing. Output: {:?}",
        output
    );
    let stderr = str::from_utf8(&output.stderr).expect("stderr is not valid UTF-8");
    assert!(
        stderr.contains("the following required arguments were not provided"),
        "Stderr should indicate missing arguments. Stderr: {}",
        stderr
    );
    assert!(
        stderr.contains("--train-images <TRAIN_IMAGES>"),
        "Stderr should specifically mention --train-images. Stderr: {}",
        stderr
    );
}

#[test]
fn test_cli_invalid_argument_value_num_epochs() {
    let output = Command::new(get_cli_path())
        .args([
            "cpfa",
            "--train-file", "dummy_train.tsv",
            "--test-file", "dummy_test.tsv",
            "--num-epochs", "not_a_number",
        ])
        .output()
        .expect("Failed to execute command with invalid --num-epochs");

    assert!(!output.status.success(), "CLI should fail on non-integer --num-epochs");
    let stderr = str::from_utf8(&output.stderr).expect("stderr is not valid UTF-8");
    assert!(
        stderr.contains("invalid value 'not_a_number'"),
        "Stderr should report the invalid value. Stderr: {}",
        stderr
    );
}

#[test]
fn test_cli_invalid_device_value() {
    let output = Command::new(get_cli_path())
        .args([
            "cpfa",
            "--train-file", "dummy_train.tsv",
            "--test-file", "dummy_test.tsv",
            "--device", "tpu",
        ])
        .output()
        .expect("Failed to execute command with invalid --device");

    assert!(!output.status.success(), "CLI should reject unknown devices");
    let stderr = str::from_utf8(&output.stderr).expect("stderr is not valid UTF-8");
    assert!(
        stderr.contains("Unknown device"),
        "Stderr should explain the device error. Stderr: {}",
        stderr
    );
}

#[test]
fn test_cli_missing_data_file_errors_gracefully() {
    let output = Command::new(get_cli_path())
        .args([
            "cpfa",
            "--train-file", "definitely_not_here.tsv",
            "--test-file", "also_missing.tsv",
            "--num-epochs", "1",
        ])
        .output()
        .expect("Failed to execute command with missing data file");

    assert!(!output.status.success(), "CLI should fail when the corpus file is missing");
    let stderr = str::from_utf8(&output.stderr).expect("stderr is not valid UTF-8");
    assert!(
        stderr.contains("Application error"),
        "Stderr should carry the application error banner. Stderr: {}",
        stderr
    );
}
