use std::process::Command;

fn main() {
    // Reported by GET /health so operators can match a running ledger to a build.
    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", utc_now());
    println!("cargo:rustc-env=BUILD_GIT_SHA={}", git_short_sha());

    println!("cargo:rerun-if-changed=.git/HEAD");
}

fn git_short_sha() -> String {
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// UTC build time without pulling chrono into the build script.
fn utc_now() -> String {
    Command::new("date")
        .args(["-u", "+%Y-%m-%dT%H:%M:%SZ"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".into())
}
