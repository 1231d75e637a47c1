//! Build script for baleful
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! used by `baleful --version`.

fn main() {
    // Re-run build if the default program overrides change
    println!("cargo:rerun-if-env-changed=BALEFUL_IPTABLES");
    println!("cargo:rerun-if-env-changed=BALEFUL_IP6TABLES");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
