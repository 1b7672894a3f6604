use std::path::Path;
use std::process::Command;

// Stamps `lessonreel --version` with the source revision, marking builds
// from a modified tree. Builds outside a git checkout carry no revision.
fn main() {
    if Path::new(".git/HEAD").exists() {
        println!("cargo:rerun-if-changed=.git/HEAD");
        println!("cargo:rerun-if-changed=.git/index");
    }

    let Some(revision) = git(&["describe", "--always", "--dirty=-modified", "--abbrev=10"])
    else {
        return;
    };
    println!("cargo:rustc-env=LESSONREEL_REVISION={revision}");
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_owned())
}
