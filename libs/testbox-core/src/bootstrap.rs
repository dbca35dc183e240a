//! Runtime injection for freshly created instances.
//!
//! The host-side runtime directory is archived once per run and extracted
//! inside each new instance, after which the family's package tooling is
//! installed so hook installers can run.

use crate::catalog::ImageConfig;
use crate::error::CoreError;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::{Path, PathBuf};

pub const REMOTE_ARCHIVE_PATH: &str = "/root/testbox_src.tar.gz";
pub const REMOTE_INJECTOR_PATH: &str = "/root/init_testbox";

/// Base-image families with a known injection procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFamily {
    Ubuntu,
    Debian,
}

impl ImageFamily {
    pub fn parse(family: &str) -> Option<Self> {
        match family.to_ascii_lowercase().as_str() {
            "ubuntu" => Some(ImageFamily::Ubuntu),
            "debian" => Some(ImageFamily::Debian),
            _ => None,
        }
    }

    /// Where the runtime archive is extracted
    pub fn install_location(&self) -> &'static str {
        match self {
            ImageFamily::Ubuntu | ImageFamily::Debian => "/usr/lib/python3/dist-packages",
        }
    }

    /// Commands that install the package tooling hook installers rely on.
    pub fn tooling_steps(&self, pip_packages: &[String]) -> Vec<Vec<String>> {
        let mut steps = match self {
            ImageFamily::Ubuntu | ImageFamily::Debian => vec![
                vec!["apt-get".to_string(), "update".to_string()],
                vec![
                    "apt-get".to_string(),
                    "install".to_string(),
                    "-y".to_string(),
                    "python3-pip".to_string(),
                ],
            ],
        };

        if !pip_packages.is_empty() {
            let mut pip = vec!["pip3".to_string(), "install".to_string()];
            pip.extend(pip_packages.iter().cloned());
            steps.push(pip);
        }
        steps
    }
}

/// The framework's own runtime tree on the controlling host.
#[derive(Debug, Clone)]
pub struct RuntimeSource {
    root: PathBuf,
}

impl RuntimeSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Archive the runtime tree as a gzipped tarball.
    ///
    /// Entries live under the tree's own directory name, so extraction
    /// recreates `<install location>/<name>/...`.
    pub fn package_source(&self) -> Result<Vec<u8>, CoreError> {
        if !self.root.is_dir() {
            return Err(CoreError::SourceNotFound(self.root.clone()));
        }
        let dir_name = self
            .root
            .file_name()
            .ok_or_else(|| CoreError::SourceNotFound(self.root.clone()))?;

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut tarball = tar::Builder::new(encoder);
        tarball
            .append_dir_all(dir_name, &self.root)
            .map_err(|e| CoreError::io(&self.root, e))?;

        let encoder = tarball
            .into_inner()
            .map_err(|e| CoreError::io(&self.root, e))?;
        encoder.finish().map_err(|e| CoreError::io(&self.root, e))
    }
}

/// Builds the injection script for one image family.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapInjector {
    family: ImageFamily,
}

impl BootstrapInjector {
    pub fn new(family: ImageFamily) -> Self {
        Self { family }
    }

    /// Injector for a catalogued image, or `UnsupportedImageFamily`.
    pub fn for_image(image: &ImageConfig) -> Result<Self, CoreError> {
        ImageFamily::parse(&image.family)
            .map(Self::new)
            .ok_or_else(|| CoreError::UnsupportedImageFamily {
                image: image.reference.clone(),
                family: image.family.clone(),
            })
    }

    pub fn family(&self) -> ImageFamily {
        self.family
    }

    /// Shell script that extracts `remote_archive_path` into the family's
    /// install location.
    pub fn build_injection_script(&self, remote_archive_path: &str) -> String {
        let dest = shell_quote(self.family.install_location());
        format!(
            "#!/bin/sh\nset -e\nmkdir -p {dest}\ntar -xzf {archive} -C {dest}\n",
            dest = dest,
            archive = shell_quote(remote_archive_path),
        )
    }
}

/// Single-quote for POSIX sh.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
