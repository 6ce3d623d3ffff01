//! Build script for fwpath
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! for `fwpath --version`.

fn main() {
    // Re-run build if the default tool locations are overridden for packaging
    println!("cargo:rerun-if-env-changed=FWPATH_IPTABLES_PATH");

    // Embed git commit, build time, and dirty status
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
