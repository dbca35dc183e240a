//! Package install procedure run for every package of every setup hook.

use crate::backend::Session;
use crate::error::CoreError;
use sha2::{Digest, Sha256};
use testbox_common::package::{PackageRef, SourceText};
use testbox_common::types::Environment;
use tracing::{debug, info};

pub const REMOTE_INSTALLER_PATH: &str = "/root/install";
const INSTALLER_SHEBANG: &str = "#!/usr/bin/env python3";

/// Deterministic remote location of a bundle: `/root/<file name>`.
pub fn remote_bundle_path(pkg: &PackageRef) -> String {
    format!("/root/{}", pkg.file_name().unwrap_or_else(|| "bundle".to_string()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Check bundle bytes against the hash the package declares.
pub fn verify_bundle(pkg: &PackageRef, bytes: &[u8]) -> Result<(), CoreError> {
    let actual = sha256_hex(bytes);
    if !actual.eq_ignore_ascii_case(pkg.hash.trim()) {
        return Err(CoreError::Integrity {
            path: pkg.path.clone(),
            expected: pkg.hash.clone(),
            actual,
        });
    }
    Ok(())
}

/// Installer script: the loader source followed by
/// `holder = <class>._load('<path>', '<hash>')` and `holder.run()`.
pub fn build_installer(loader_source: &str, loader_class: &str, remote_path: &str, hash: &str) -> String {
    let mut script = String::new();
    if !loader_source.starts_with("#!") {
        script.push_str(INSTALLER_SHEBANG);
        script.push('\n');
    }
    script.push_str(loader_source);
    if !loader_source.ends_with('\n') {
        script.push('\n');
    }
    script.push_str(&format!(
        "holder = {}._load({}, {})\n",
        loader_class,
        py_quote(remote_path),
        py_quote(hash)
    ));
    script.push_str("holder.run()\n");
    script
}

fn py_quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Install one package into the session's instance and merge its side
/// effects into `env`.
pub async fn install_package(
    session: &Session<'_>,
    pkg: &PackageRef,
    env: &mut Environment,
) -> Result<(), CoreError> {
    let bundle = tokio::fs::read(&pkg.path)
        .await
        .map_err(|e| CoreError::io(&pkg.path, e))?;
    verify_bundle(pkg, &bundle)?;

    let loader_source = pkg.loader.source.read().map_err(|e| match &pkg.loader.source {
        SourceText::File(path) => CoreError::io(path, e),
        SourceText::Inline(_) => CoreError::io(&pkg.path, e),
    })?;

    let remote_path = remote_bundle_path(pkg);
    session.put_file(&remote_path, &bundle).await?;

    let installer = build_installer(&loader_source, &pkg.loader.class, &remote_path, &pkg.hash);
    session
        .put_file(REMOTE_INSTALLER_PATH, installer.as_bytes())
        .await?;

    let raw = session
        .run_script(REMOTE_INSTALLER_PATH, &Environment::new())
        .await?;
    if !raw.succeeded() {
        return Err(CoreError::InstallerFailed {
            package: pkg.path.display().to_string(),
            exit_code: raw.exit_code,
            stderr: raw.stderr_lossy(),
        });
    }

    let merged = pkg.kind.merge_side_effects(&raw.stdout_lossy(), env)?;
    if merged > 0 {
        debug!(package = %pkg.path.display(), kind = %pkg.kind, merged, "Merged installer output into environment");
    }

    info!(
        instance = %session.handle().name,
        package = %pkg.path.display(),
        kind = %pkg.kind,
        "Package installed"
    );
    Ok(())
}
