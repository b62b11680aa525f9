//! Configuration file handling for swiftdrop.

use crate::error::Error;
use crate::relay::RelayConfig;
use crate::routing::{DEFAULT_DESTINATION, Destination, RoutingTable};
use crate::swift::{Auth, OsOptions, StoreConfig};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Both the proxy and the internal MTA live on the loopback interface.
pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

const PARAMS_SECTION: &str = "params";
/// Name serini gives to the keys above the first section header.
const ROOT_SECTION: &str = "";

/// Written to the config path when no config exists yet.
pub const TEMPLATE: &str = "\
# swiftdrop configuration

[params]
# listen_port = 10025
# mta_port = 10026
# idle_timeout = 120
# data_timeout = 600
# max_message_size = 31457280

# Store settings shared by all destinations. With a container set, this
# section also receives mail for recipients no destination owns.
[DEFAULT]
# auth_version = 3
# authurl = https://keystone.example.com/v3
# user = swiftdrop
# key = secret
# os_options_user_domain_name = Default
# os_options_project_name = mail
# os_options_project_domain_name = Default
# os_options_region_name = RegionOne
# timeout = 30

# One section per destination.
# [archive]
# recipient = archive@example.com journal@example.com
# container = mail-archive
";

/// Proxy process settings from the `[params]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct Params {
    #[serde(default = "Params::default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "Params::default_mta_port")]
    pub mta_port: u16,
    /// Seconds.
    #[serde(default = "Params::default_idle_timeout")]
    pub idle_timeout: u64,
    /// Seconds; unbounded when unset.
    #[serde(default)]
    pub data_timeout: Option<u64>,
    #[serde(default = "Params::default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            listen_port: Self::default_listen_port(),
            mta_port: Self::default_mta_port(),
            idle_timeout: Self::default_idle_timeout(),
            data_timeout: None,
            max_message_size: Self::default_max_message_size(),
        }
    }
}

impl Params {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(LOCALHOST, self.listen_port)
    }

    pub fn mta_addr(&self) -> SocketAddr {
        SocketAddr::new(LOCALHOST, self.mta_port)
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout),
            data_timeout: self.data_timeout.map(Duration::from_secs),
            max_message_size: self.max_message_size,
        }
    }

    // Following are needed since serde does not support default literals.

    const fn default_listen_port() -> u16 {
        10025
    }
    const fn default_mta_port() -> u16 {
        10026
    }
    const fn default_idle_timeout() -> u64 {
        120
    }
    const fn default_max_message_size() -> usize {
        31457280
    }
}

#[derive(Debug, Deserialize)]
struct ParamsWrapper {
    #[serde(default)]
    params: Params,
}

/// One INI section as written, before `[DEFAULT]` is applied.
#[derive(Debug, Clone, Default, Deserialize)]
struct Section {
    #[serde(default, deserialize_with = "deserialize_sequence")]
    recipient: Vec<String>,
    auth_version: Option<String>,
    authurl: Option<String>,
    user: Option<String>,
    key: Option<String>,
    tenant_name: Option<String>,
    container: Option<String>,
    timeout: Option<u64>,
    os_options_project_name: Option<String>,
    os_options_project_id: Option<String>,
    os_options_project_domain_name: Option<String>,
    os_options_project_domain_id: Option<String>,
    os_options_user_domain_name: Option<String>,
    os_options_user_domain_id: Option<String>,
    os_options_region_name: Option<String>,
    os_options_endpoint_type: Option<String>,
    os_options_object_storage_url: Option<String>,
}

/// Custom deserializer to parse space-separated strings into [`Vec<String>`].
fn deserialize_sequence<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(deserializer)?;
    Ok(match s {
        Some(v) => v
            .split(' ')
            .map(|item| item.trim().to_lowercase())
            .filter(|item| !item.is_empty())
            .collect(),
        None => Vec::new(),
    })
}

fn required(name: &str, field: &str, value: Option<String>) -> Result<String, Error> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::Destination {
            name: name.to_string(),
            reason: format!("missing {field}"),
        }),
    }
}

impl Section {
    /// Fills unset store fields from `defaults`. Recipients are never inherited.
    fn merged(self, defaults: &Section) -> Section {
        Section {
            recipient: self.recipient,
            auth_version: self.auth_version.or_else(|| defaults.auth_version.clone()),
            authurl: self.authurl.or_else(|| defaults.authurl.clone()),
            user: self.user.or_else(|| defaults.user.clone()),
            key: self.key.or_else(|| defaults.key.clone()),
            tenant_name: self.tenant_name.or_else(|| defaults.tenant_name.clone()),
            container: self.container.or_else(|| defaults.container.clone()),
            timeout: self.timeout.or(defaults.timeout),
            os_options_project_name: self
                .os_options_project_name
                .or_else(|| defaults.os_options_project_name.clone()),
            os_options_project_id: self
                .os_options_project_id
                .or_else(|| defaults.os_options_project_id.clone()),
            os_options_project_domain_name: self
                .os_options_project_domain_name
                .or_else(|| defaults.os_options_project_domain_name.clone()),
            os_options_project_domain_id: self
                .os_options_project_domain_id
                .or_else(|| defaults.os_options_project_domain_id.clone()),
            os_options_user_domain_name: self
                .os_options_user_domain_name
                .or_else(|| defaults.os_options_user_domain_name.clone()),
            os_options_user_domain_id: self
                .os_options_user_domain_id
                .or_else(|| defaults.os_options_user_domain_id.clone()),
            os_options_region_name: self
                .os_options_region_name
                .or_else(|| defaults.os_options_region_name.clone()),
            os_options_endpoint_type: self
                .os_options_endpoint_type
                .or_else(|| defaults.os_options_endpoint_type.clone()),
            os_options_object_storage_url: self
                .os_options_object_storage_url
                .or_else(|| defaults.os_options_object_storage_url.clone()),
        }
    }

    fn into_destination(self, name: &str) -> Result<Destination, Error> {
        let auth = match self.auth_version.as_deref() {
            None | Some("3") | Some("3.0") => Auth::V3(OsOptions {
                project_name: self.os_options_project_name,
                project_id: self.os_options_project_id,
                project_domain_name: self.os_options_project_domain_name,
                project_domain_id: self.os_options_project_domain_id,
                user_domain_name: self.os_options_user_domain_name,
                user_domain_id: self.os_options_user_domain_id,
                region_name: self.os_options_region_name,
                endpoint_type: self.os_options_endpoint_type,
                object_storage_url: self.os_options_object_storage_url,
            }),
            Some("1") | Some("1.0") => Auth::V1 {
                tenant_name: self.tenant_name,
            },
            Some(other) => {
                return Err(Error::Destination {
                    name: name.to_string(),
                    reason: format!("unsupported auth_version {other:?}"),
                });
            }
        };

        Ok(Destination {
            name: name.to_string(),
            recipients: self.recipient,
            store: StoreConfig {
                auth,
                authurl: required(name, "authurl", self.authurl)?,
                user: required(name, "user", self.user)?,
                key: required(name, "key", self.key)?,
                container: required(name, "container", self.container)?,
                timeout: self.timeout.map(Duration::from_secs),
            },
        })
    }
}

/// Parsed configuration: process parameters and the routing table.
#[derive(Debug)]
pub struct Config {
    pub params: Params,
    pub routing: RoutingTable,
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, Error> {
        let ParamsWrapper { params } = serini::from_str(content)?;

        let mut sections: BTreeMap<String, Section> = serini::from_str(content)?;
        sections.remove(PARAMS_SECTION);
        sections.remove(ROOT_SECTION);
        let defaults = sections.remove(DEFAULT_DESTINATION).unwrap_or_default();

        let default = match defaults.container {
            Some(_) => Some(defaults.clone().into_destination(DEFAULT_DESTINATION)?),
            None => None,
        };

        let destinations = sections
            .into_iter()
            .map(|(name, section)| section.merged(&defaults).into_destination(&name))
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "{} destination(s), default destination {}",
            destinations.len(),
            if default.is_some() { "set" } else { "unset" }
        );

        Ok(Self {
            params,
            routing: RoutingTable::new(destinations, default),
        })
    }
}
