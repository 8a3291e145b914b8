use std::{
    env, fs, path::PathBuf, process::{exit, Command}
};

/// Plugin crates and the binaries they produce.
const PLUGINS: &[(&str, &str)] = &[
    ("plugin_echo", "echo"),
];

fn main() {
    let args: Vec<String> = env::args().collect();

    // Optional filtering via CLI: cargo run -p xtask -- plugin_echo
    let selected: Vec<(&str, &str)> = if args.len() > 1 {
        let mut wanted = Vec::new();
        for name in &args[1..] {
            match PLUGINS.iter().find(|(pkg, _)| pkg == name) {
                Some(entry) => wanted.push(*entry),
                None => {
                    eprintln!("Unknown plugin crate `{}`", name);
                    exit(1);
                }
            }
        }
        wanted
    } else {
        PLUGINS.to_vec()
    };

    let crate_dir = PathBuf::from(".");
    let out_dir = PathBuf::from("bin");
    if let Err(e) = fs::create_dir_all(&out_dir) {
        eprintln!("Failed to create {}: {}", out_dir.display(), e);
        exit(1);
    }

    for (pkg, bin) in selected {
        println!("Building `{}`…", pkg);

        // 1) `cargo build --release --package {pkg}`
        let status = Command::new("cargo")
            .args(["build", "--release", "--package", pkg])
            .status()
            .unwrap_or_else(|e| {
                eprintln!("Failed to launch cargo for `{}`: {}", pkg, e);
                exit(1);
            });
        if !status.success() {
            eprintln!("Cargo build failed for `{}`.", pkg);
            exit(1);
        }

        // 2) executable name, `.exe` on Windows
        let filename = format!("{}{}", bin, env::consts::EXE_SUFFIX);

        // 3) copy from target/release to ./bin
        let built_path = crate_dir.join("target").join("release").join(&filename);
        let dest_path = out_dir.join(&filename);
        if let Err(e) = fs::copy(&built_path, &dest_path) {
            eprintln!(
                "Failed to copy `{}` → `{}`: {}",
                built_path.display(),
                dest_path.display(),
                e
            );
            exit(1);
        }
        println!("Copied {} → {}", built_path.display(), dest_path.display());
    }
}
