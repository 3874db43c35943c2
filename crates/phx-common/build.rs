//! ---
//! phx_section: "01-core-functionality"
//! phx_subsection: "build"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Build script emitting version metadata."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Source tarballs have no git metadata; `VersionInfo` falls back to UNKNOWN.
    EmitBuilder::builder()
        .all_build()
        .all_cargo()
        .all_git()
        .emit()?;

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
