use vergen::{generate_cargo_keys, ConstantsFlags};

fn main() {
    // The SHA and build timestamp come from git and the environment. A source
    // tarball has no git metadata, so fall back to placeholder values rather
    // than failing the build.
    if generate_cargo_keys(
        ConstantsFlags::SHA_SHORT
            | ConstantsFlags::SEMVER_FROM_CARGO_PKG
            | ConstantsFlags::BUILD_TIMESTAMP,
    )
    .is_err()
    {
        println!(
            "cargo:rustc-env=VERGEN_SEMVER={}",
            env!("CARGO_PKG_VERSION")
        );
        println!("cargo:rustc-env=VERGEN_SHA_SHORT=unknown");
        println!("cargo:rustc-env=VERGEN_BUILD_TIMESTAMP=unknown");
    }
}
