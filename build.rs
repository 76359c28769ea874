use std::process::Command;

fn main() {
    // Build metadata surfaced by `qrelay version`
    println!(
        "cargo:rustc-env=QRELAY_GIT_HASH={}",
        command_stdout("git", &["rev-parse", "--short", "HEAD"])
    );
    println!(
        "cargo:rustc-env=QRELAY_BUILD_DATE={}",
        command_stdout("date", &["+%Y-%m-%d"])
    );

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/");
}

/// Trimmed stdout of a command, or "unknown" when it is unavailable or fails.
fn command_stdout(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
