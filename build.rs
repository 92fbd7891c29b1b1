use std::process::Command;

fn main() {
    // A script root baked in at compile time. `PYHOOK_PYTHON_PATH` at run time
    // still takes priority (see `BridgeConfig::from_env`).
    println!("cargo:rerun-if-env-changed=PYHOOK_DEFAULT_PYTHON_PATH");
    if let Ok(root) = std::env::var("PYHOOK_DEFAULT_PYTHON_PATH") {
        if !root.is_empty() {
            println!("cargo:rustc-env=PYHOOK_DEFAULT_PYTHON_PATH={root}");
        }
    }

    if let Ok(output) = Command::new("python3").args(["--version"]).output() {
        if output.status.success() {
            let version = String::from_utf8_lossy(&output.stdout);
            println!("cargo:warning=Embedding {}", version.trim());
        }
    }

    // PyO3 links libpython for us; add LIBDIR so non-system installs
    // (pyenv, conda) resolve at link time too.
    if let Ok(output) = Command::new("python3")
        .args([
            "-c",
            "import sysconfig; print(sysconfig.get_config_var('LIBDIR'))",
        ])
        .output()
    {
        if output.status.success() {
            let libdir = String::from_utf8_lossy(&output.stdout);
            let libdir = libdir.trim();
            if !libdir.is_empty() && libdir != "None" {
                println!("cargo:rustc-link-search=native={libdir}");
                if std::env::var("CARGO_CFG_TARGET_FAMILY").as_deref() == Ok("unix") {
                    println!("cargo:rustc-link-arg=-Wl,-rpath,{libdir}");
                }
            }
        }
    }
}
