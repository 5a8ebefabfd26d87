use std::path::Path;

// Return the first existing path given a list of paths as string slices
fn get_first_path(paths: &[&'static str]) -> Option<&'static str> {
    paths.iter().find(|p| Path::new(p).exists()).copied()
}

fn main() {
    let path_grantpty = std::env::var("PROCPTY_GRANTPTY_PATH").unwrap_or_else(|_| {
        get_first_path(&[
            "/usr/libexec/procpty/grantpty",
            "/usr/lib/procpty/grantpty",
            "/usr/local/libexec/procpty/grantpty",
        ])
        .unwrap_or("/usr/libexec/procpty/grantpty")
        .to_string()
    });

    let tty_group = std::env::var("PROCPTY_TTY_GROUP").unwrap_or_else(|_| "tty".to_string());

    println!("cargo:rustc-env=PROCPTY_GRANTPTY_PATH={path_grantpty}");
    println!("cargo:rustc-env=PROCPTY_TTY_GROUP={tty_group}");
    println!("cargo:rerun-if-env-changed=PROCPTY_GRANTPTY_PATH");
    println!("cargo:rerun-if-env-changed=PROCPTY_TTY_GROUP");
    println!("cargo:rerun-if-changed=build.rs");
}
