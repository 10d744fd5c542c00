#![allow(unused)]

use std::path::PathBuf;

/// Split `PATH`-like variables into individual directories.
fn split_paths(paths: &str) -> impl Iterator<Item = String> + '_ {
    let split_char = if cfg!(windows) { ';' } else { ':' };
    paths.split(split_char).filter(|p| !p.is_empty()).map(String::from)
}

/// Existing library directories below the roots named by `env_vars` and the
/// usual system prefixes.
fn library_dirs(env_vars: &[&str]) -> Vec<PathBuf> {
    let system_roots = ["/usr", "/usr/local", "/opt"];
    let lib_dirs = ["", "lib", "lib64", "lib/x86_64-linux-gnu"];

    let roots = env_vars
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .flat_map(|paths| split_paths(&paths).collect::<Vec<_>>())
        .chain(system_roots.into_iter().map(String::from))
        .map(PathBuf::from)
        .collect::<Vec<_>>();
    roots
        .iter()
        .flat_map(|root| lib_dirs.iter().map(move |lib| root.join(lib)))
        .filter(|path| path.exists())
        .filter_map(|path| std::fs::canonicalize(path).ok())
        .collect()
}

fn link_openblas() {
    println!("cargo:rerun-if-env-changed=DPD_OPENBLAS_DIR");
    for path in library_dirs(&["DPD_OPENBLAS_DIR", "LD_LIBRARY_PATH", "DYLD_LIBRARY_PATH"]) {
        println!("cargo:rustc-link-search=native={}", path.display());
    }
    println!("cargo:rustc-link-lib=openblas");
    println!("cargo:rustc-link-lib=gomp");
}

fn main() {
    #[cfg(feature = "use_openblas")]
    link_openblas();
}
