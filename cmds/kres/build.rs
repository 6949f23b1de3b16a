use std::process::Command;

/// Version used while Cargo.toml still carries the unreleased placeholder.
const PLACEHOLDER_VERSION: &str = "0.1.0";

fn main() {
	println!("cargo:rerun-if-changed=.git/HEAD");
	println!("cargo:rerun-if-changed=.git/refs/");

	println!("cargo:rustc-env=KRES_VERSION={}", version());
}

/// Release version, else the exact tag at HEAD, else the short commit.
fn version() -> String {
	let package = env!("CARGO_PKG_VERSION");
	if package != PLACEHOLDER_VERSION {
		return package.to_string();
	}

	git(&["describe", "--tags", "--exact-match", "HEAD"])
		.map(|tag| tag.trim_start_matches('v').to_string())
		.or_else(|| git(&["rev-parse", "--short", "HEAD"]))
		.unwrap_or_else(|| package.to_string())
}

fn git(args: &[&str]) -> Option<String> {
	let output = Command::new("git").args(args).output().ok()?;
	if !output.status.success() {
		return None;
	}
	let stdout = String::from_utf8(output.stdout).ok()?;
	Some(stdout.trim().to_string()).filter(|line| !line.is_empty())
}
