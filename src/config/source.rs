use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::error::{Classify as _, FailureClass};

use super::InstallConfig;

/// Prefix of the process environment variables that override settings.
pub const ENV_PREFIX: &str = "CRYPTFORGE_";

/// A supplier of `KEY=VALUE` overrides on top of the built-in defaults.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    fn source_debug_string(&self) -> String;

    async fn entries(&self) -> Result<Vec<(String, String)>>;
}

/// Overrides read from a dotenv-style file.
pub struct EnvFileSource {
    path: PathBuf,
}

impl EnvFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for EnvFileSource {
    fn source_debug_string(&self) -> String {
        format!("env file: {:?}", self.path)
    }

    async fn entries(&self) -> Result<Vec<(String, String)>> {
        tracing::debug!("Loading configuration overrides from: {:?}", self.path);

        let iter = dotenvy::from_path_iter(&self.path)
            .with_context(|| format!("Failed to open env file {:?}", self.path))?;
        let mut entries = vec![];
        for item in iter {
            let (key, value) =
                item.with_context(|| format!("Failed to parse env file {:?}", self.path))?;
            let key = key
                .strip_prefix(ENV_PREFIX)
                .map(str::to_owned)
                .unwrap_or(key);
            entries.push((key, value));
        }
        Ok(entries)
    }
}

/// Overrides read from `CRYPTFORGE_<KEY>` variables of the process environment. Values are
/// kept as read and only have to be UTF-8 once they are applied.
pub struct ProcessEnvSource {
    vars: Vec<(String, OsString)>,
}

impl ProcessEnvSource {
    pub fn from_process() -> Self {
        Self::from_os_vars(std::env::vars_os())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        Self::from_os_vars(
            vars.into_iter()
                .map(|(key, value)| (OsString::from(key), OsString::from(value))),
        )
    }

    /// Variables whose name is not UTF-8 or lacks the prefix are none of our business.
    pub fn from_os_vars(vars: impl IntoIterator<Item = (OsString, OsString)>) -> Self {
        let mut vars = vars
            .into_iter()
            .filter_map(|(key, value)| {
                let key = key.to_str()?.strip_prefix(ENV_PREFIX)?.to_owned();
                Some((key, value))
            })
            .collect::<Vec<_>>();
        vars.sort();
        Self { vars }
    }
}

#[async_trait]
impl ConfigSource for ProcessEnvSource {
    fn source_debug_string(&self) -> String {
        format!("process environment ({ENV_PREFIX}*)")
    }

    async fn entries(&self) -> Result<Vec<(String, String)>> {
        self.vars
            .iter()
            .map(|(key, value)| {
                let value = value
                    .to_str()
                    .with_context(|| format!("{ENV_PREFIX}{key} is not valid UTF-8: {value:?}"))?;
                Ok((key.clone(), value.to_owned()))
            })
            .collect()
    }
}

/// The sources of a command line invocation: the env file, if one was given, then the process
/// environment.
pub fn sources_for(env_file: Option<&Path>) -> Vec<Box<dyn ConfigSource>> {
    let mut sources: Vec<Box<dyn ConfigSource>> = vec![];
    if let Some(env_file) = env_file {
        sources.push(Box::new(EnvFileSource::new(env_file)));
    }
    sources.push(Box::new(ProcessEnvSource::from_process()));
    sources
}

/// Resolve the configuration: defaults first, then each source in order, later ones winning.
pub async fn load_config(sources: &[Box<dyn ConfigSource>]) -> Result<InstallConfig> {
    async {
        let mut config = InstallConfig::default();
        for source in sources {
            let entries = source
                .entries()
                .await
                .with_context(|| format!("Failed to read {}", source.source_debug_string()))?;
            for (key, value) in entries {
                tracing::debug!(key = %key, source = %source.source_debug_string(), "Applying override");
                config.apply(&key, &value).with_context(|| {
                    format!(
                        "Bad value for {key} from {}",
                        source.source_debug_string()
                    )
                })?;
            }
        }
        config.validate()?;
        Ok::<_, anyhow::Error>(config)
    }
    .await
    .classify(FailureClass::Configuration)
}

#[cfg(test)]
pub mod tests {

    #[allow(unused_imports)]
    use super::*;
    use crate::error::failure_class_of;
    use std::io::Write as _;

    #[tokio::test]
    async fn test_later_sources_override_earlier_ones() -> Result<()> {
        let mut env_file = tempfile::NamedTempFile::new()?;
        writeln!(env_file, "# provisioning overrides")?;
        writeln!(env_file, "DISK=/dev/vdb")?;
        writeln!(env_file, "CRYPTFORGE_HOSTNAME=forge")?;
        writeln!(env_file, "SWAP_SIZE=4G")?;
        env_file.flush()?;

        let sources: Vec<Box<dyn ConfigSource>> = vec![
            Box::new(EnvFileSource::new(env_file.path())),
            Box::new(ProcessEnvSource::from_vars([
                ("CRYPTFORGE_SWAP_SIZE".to_owned(), "2G".to_owned()),
                ("PATH".to_owned(), "/usr/bin".to_owned()),
            ])),
        ];
        let config = load_config(&sources).await?;

        assert_eq!(config.disk, PathBuf::from("/dev/vdb"));
        assert_eq!(config.hostname, "forge");
        assert_eq!(config.swap_size, crate::types::ByteSize::gib(2));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_key_is_configuration_error() {
        let sources: Vec<Box<dyn ConfigSource>> = vec![Box::new(ProcessEnvSource::from_vars([(
            "CRYPTFORGE_DISKK".to_owned(),
            "/dev/sda".to_owned(),
        )]))];
        let error = load_config(&sources).await.unwrap_err();
        assert_eq!(failure_class_of(&error), Some(FailureClass::Configuration));
    }

    #[tokio::test]
    async fn test_missing_env_file_is_configuration_error() {
        let sources: Vec<Box<dyn ConfigSource>> =
            vec![Box::new(EnvFileSource::new("/nonexistent/cryptforge.env"))];
        let error = load_config(&sources).await.unwrap_err();
        assert_eq!(failure_class_of(&error), Some(FailureClass::Configuration));
    }

    #[test]
    fn test_env_file_comes_first() {
        let sources = sources_for(Some(Path::new("/etc/cryptforge.env")));
        assert_eq!(sources.len(), 2);
        assert!(sources[0].source_debug_string().contains("cryptforge.env"));
        assert!(sources[1].source_debug_string().contains(ENV_PREFIX));
        assert_eq!(sources_for(None).len(), 1);
    }

    #[tokio::test]
    async fn test_non_utf8_environment() -> Result<()> {
        use std::os::unix::ffi::OsStringExt as _;

        let latin1 = || OsString::from_vec(b"caf\xe9".to_vec());

        let unrelated: Vec<Box<dyn ConfigSource>> =
            vec![Box::new(ProcessEnvSource::from_os_vars([
                (OsString::from("LANG_NOTE"), latin1()),
                (OsString::from_vec(b"\xffCRYPTFORGE".to_vec()), latin1()),
                (OsString::from("CRYPTFORGE_HOSTNAME"), OsString::from("forge")),
            ]))];
        assert_eq!(load_config(&unrelated).await?.hostname, "forge");

        let ours: Vec<Box<dyn ConfigSource>> = vec![Box::new(ProcessEnvSource::from_os_vars([(
            OsString::from("CRYPTFORGE_HOSTNAME"),
            latin1(),
        )]))];
        let error = load_config(&ours).await.unwrap_err();
        assert_eq!(failure_class_of(&error), Some(FailureClass::Configuration));
        assert!(format!("{error:#}").contains("CRYPTFORGE_HOSTNAME is not valid UTF-8"));
        Ok(())
    }

    #[test]
    fn test_from_process_tolerates_foreign_variables() {
        let _ = ProcessEnvSource::from_process();
    }

    #[tokio::test]
    async fn test_no_sources_yields_defaults() -> Result<()> {
        assert_eq!(load_config(&[]).await?, InstallConfig::default());
        Ok(())
    }
}
