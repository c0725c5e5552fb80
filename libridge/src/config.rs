use crate::error::{BridgeError, Result};
use crate::multiplexer::DEFAULT_SERIAL_PORT;
use rumqttc::{MqttOptions, QoS};
use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

/// Overrides `--username`
pub const USER_ENV: &str = "LC_LIBRIDGE_USER";
/// Overrides `--password`
pub const PASSWORD_ENV: &str = "LC_LIBRIDGE_PWD";

pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_CLIENT_ID: &str = "mqttSerialBridge";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything the bridge needs to start, resolved from CLI + environment
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// 0 (at most once) or 1 (at least once)
    pub qos: u8,
    pub credentials: Option<Credentials>,
    /// Internal (serial-side) node ids
    pub nodes: BTreeSet<String>,
    pub mapping_path: Option<PathBuf>,
    pub serial_port: u16,
    pub reconnect_delay: Duration,
}

impl BridgeConfig {
    pub fn new(broker_host: impl Into<String>, nodes: BTreeSet<String>) -> Self {
        Self {
            broker_host: broker_host.into(),
            broker_port: DEFAULT_BROKER_PORT,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            keep_alive_secs: 30,
            qos: 0,
            credentials: None,
            nodes,
            mapping_path: None,
            serial_port: DEFAULT_SERIAL_PORT,
            reconnect_delay: Duration::from_secs(2),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker_host.trim().is_empty() {
            return Err(BridgeError::Config("broker address is required".into()));
        }
        if self.nodes.is_empty() {
            return Err(BridgeError::Config("no nodes selected".into()));
        }
        if self.client_id.is_empty() {
            return Err(BridgeError::Config("client id must not be empty".into()));
        }
        self.mqtt_qos()?;
        Ok(())
    }

    pub fn mqtt_qos(&self) -> Result<QoS> {
        match self.qos {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(BridgeError::Config(format!(
                "unsupported QoS {other}, only 0 and 1 are passed through"
            ))),
        }
    }

    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.broker_host, self.broker_port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs));
        options.set_clean_session(true);
        if let Some(credentials) = &self.credentials {
            options.set_credentials(&credentials.username, &credentials.password);
        }
        options
    }
}

/// Credentials from the command line, with `LC_LIBRIDGE_USER` and
/// `LC_LIBRIDGE_PWD` taking precedence when set.
pub fn resolve_credentials(
    cli_username: Option<String>,
    cli_password: Option<String>,
) -> Result<Option<Credentials>> {
    resolve_credentials_with(cli_username, cli_password, |key| std::env::var(key).ok())
}

pub fn resolve_credentials_with<F>(
    cli_username: Option<String>,
    cli_password: Option<String>,
    env: F,
) -> Result<Option<Credentials>>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |value: Option<String>| value.filter(|v| !v.is_empty());
    let username = non_empty(env(USER_ENV)).or(non_empty(cli_username));
    let password = non_empty(env(PASSWORD_ENV)).or(non_empty(cli_password));

    match (username, password) {
        (Some(username), Some(password)) => Ok(Some(Credentials { username, password })),
        (None, None) => Ok(None),
        (Some(_), None) => Err(BridgeError::Config(format!(
            "username given without password (set --password or {PASSWORD_ENV})"
        ))),
        (None, Some(_)) => Err(BridgeError::Config(format!(
            "password given without username (set --username or {USER_ENV})"
        ))),
    }
}

/// Node ids separated by newlines, commas or whitespace; `#` starts a comment
pub fn parse_node_list(text: &str) -> BTreeSet<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .flat_map(|line| line.split(|c: char| c == ',' || c.is_whitespace()))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn load_node_file<P: AsRef<Path>>(path: P) -> Result<BTreeSet<String>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| BridgeError::Config(format!("cannot read node list {}: {e}", path.display())))?;
    Ok(parse_node_list(&text))
}

/// Environment file consumed by the bridge when it is launched as an IoT-LAB
/// experiment script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptConfig {
    pub host: String,
    pub port: u16,
    pub verbose: u8,
    pub username_bridge: String,
    pub password_bridge: String,
    pub topic: String,
    pub username_iotlab: Option<String>,
    pub password_iotlab: Option<String>,
}

impl ScriptConfig {
    pub fn render(&self) -> String {
        let mut out = format!(
            "LI_BRIDGE_HOST={}\nLI_BRIDGE_PORT={}\nLI_BRIDGE_VERBOSE={}\nLI_BRIDGE_USER={}\nLI_BRIDGE_PWD={}\n",
            self.host, self.port, self.verbose, self.username_bridge, self.password_bridge
        );
        if let Some(user) = &self.username_iotlab {
            out.push_str(&format!("LI_IOTLAB_USER={user}\n"));
        }
        if let Some(password) = &self.password_iotlab {
            out.push_str(&format!("LI_IOTLAB_PWD={password}\n"));
        }
        out.push_str(&format!("LI_BRIDGE_TOPIC={}\n", self.topic));
        out
    }

    /// Writes the file to a temporary location; it is removed when the
    /// returned handle is dropped.
    pub fn write_temp(&self) -> Result<ScriptConfigFile> {
        let mut file = tempfile::Builder::new()
            .prefix("iotlab_mqtt_bridge")
            .tempfile()?;
        file.write_all(self.render().as_bytes())?;
        file.flush()?;
        Ok(ScriptConfigFile { file })
    }
}

/// Temporary script config, deleted on drop
#[derive(Debug)]
pub struct ScriptConfigFile {
    file: NamedTempFile,
}

impl ScriptConfigFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn nodes(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::new("broker.local", nodes(&["m3-1"]));
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.serial_port, 20000);
        assert_eq!(config.client_id, "mqttSerialBridge");
        assert_eq!(config.mqtt_qos().unwrap(), QoS::AtMostOnce);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let missing_broker = BridgeConfig::new(" ", nodes(&["m3-1"]));
        assert!(matches!(missing_broker.validate(), Err(BridgeError::Config(_))));

        let no_nodes = BridgeConfig::new("broker", BTreeSet::new());
        assert!(matches!(no_nodes.validate(), Err(BridgeError::Config(_))));

        let mut exactly_once = BridgeConfig::new("broker", nodes(&["m3-1"]));
        exactly_once.qos = 2;
        assert!(matches!(exactly_once.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_mqtt_options() {
        let mut config = BridgeConfig::new("broker.local", nodes(&["m3-1"]));
        config.broker_port = 8883;
        config.credentials = Some(Credentials {
            username: "alice".into(),
            password: "secret".into(),
        });
        let options = config.mqtt_options();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 8883));
        assert_eq!(options.client_id(), "mqttSerialBridge");
        assert!(options.clean_session());
        assert_eq!(options.credentials(), Some(("alice".to_string(), "secret".to_string())));
    }

    #[test]
    fn test_env_overrides_cli_credentials() {
        let env = env_of(&[(USER_ENV, "env-user"), (PASSWORD_ENV, "env-pwd")]);
        let creds = resolve_credentials_with(Some("cli".into()), Some("cli-pwd".into()), env)
            .unwrap()
            .unwrap();
        assert_eq!(creds.username, "env-user");
        assert_eq!(creds.password, "env-pwd");
    }

    #[test]
    fn test_cli_credentials_without_env() {
        let creds = resolve_credentials_with(Some("cli".into()), Some("pwd".into()), env_of(&[]))
            .unwrap()
            .unwrap();
        assert_eq!(creds.username, "cli");

        assert_eq!(resolve_credentials_with(None, None, env_of(&[])).unwrap(), None);
    }

    #[test]
    fn test_half_credentials_rejected() {
        let only_user = resolve_credentials_with(Some("cli".into()), None, env_of(&[]));
        assert!(matches!(only_user, Err(BridgeError::Config(_))));

        let only_env_pwd = resolve_credentials_with(None, None, env_of(&[(PASSWORD_ENV, "x")]));
        assert!(matches!(only_env_pwd, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials {
            username: "alice".into(),
            password: "hunter2".into(),
        };
        let printed = format!("{creds:?}");
        assert!(printed.contains("alice"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_parse_node_list() {
        let text = "m3-1, m3-2\n# reserved\na8-3 # the gateway\n\n  m3-1\n";
        assert_eq!(parse_node_list(text), nodes(&["a8-3", "m3-1", "m3-2"]));
    }

    #[test]
    fn test_load_node_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "m3-10\nm3-11").unwrap();
        assert_eq!(load_node_file(file.path()).unwrap(), nodes(&["m3-10", "m3-11"]));
        assert!(matches!(load_node_file("/nonexistent/nodes"), Err(BridgeError::Config(_))));
    }

    fn script_config() -> ScriptConfig {
        ScriptConfig {
            host: "broker.local".into(),
            port: 1883,
            verbose: 1,
            username_bridge: "bridge".into(),
            password_bridge: "pwd".into(),
            topic: "testbed".into(),
            username_iotlab: Some("iot".into()),
            password_iotlab: None,
        }
    }

    #[test]
    fn test_script_config_render() {
        let rendered = script_config().render();
        assert_eq!(
            rendered,
            "LI_BRIDGE_HOST=broker.local\nLI_BRIDGE_PORT=1883\nLI_BRIDGE_VERBOSE=1\n\
             LI_BRIDGE_USER=bridge\nLI_BRIDGE_PWD=pwd\nLI_IOTLAB_USER=iot\nLI_BRIDGE_TOPIC=testbed\n"
        );
    }

    #[test]
    fn test_script_config_file_removed_on_drop() {
        let file = script_config().write_temp().unwrap();
        let path = file.path().to_path_buf();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("iotlab_mqtt_bridge"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), script_config().render());

        drop(file);
        assert!(!path.exists());
    }
}
