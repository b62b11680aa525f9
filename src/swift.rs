//! Minimal OpenStack Swift client: authenticate, create container, put object.

use crate::error::Error;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CONTENT_TYPE_RFC822: &str = "message/rfc822";

/// Keystone authentication flavour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    /// Legacy v1 auth (`X-Auth-User`/`X-Auth-Key`).
    V1 { tenant_name: Option<String> },
    /// Keystone v3 password auth.
    V3(OsOptions),
}

impl Default for Auth {
    fn default() -> Self {
        Auth::V3(OsOptions::default())
    }
}

/// Keystone v3 scoping and endpoint selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsOptions {
    pub project_name: Option<String>,
    pub project_id: Option<String>,
    pub project_domain_name: Option<String>,
    pub project_domain_id: Option<String>,
    pub user_domain_name: Option<String>,
    pub user_domain_id: Option<String>,
    pub region_name: Option<String>,
    pub endpoint_type: Option<String>,
    pub object_storage_url: Option<String>,
}

/// Connection parameters of one destination's object store.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub auth: Auth,
    pub authurl: String,
    pub user: String,
    pub key: String,
    pub container: String,
    pub timeout: Option<Duration>,
}

/// An authenticated Swift session.
#[derive(Debug)]
pub struct Connection {
    client: Client,
    storage_url: String,
    token: String,
}

// Keystone v3 request body.

#[derive(Serialize)]
struct AuthRequest<'a> {
    auth: AuthBody<'a>,
}

#[derive(Serialize)]
struct AuthBody<'a> {
    identity: Identity<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<Scope<'a>>,
}

#[derive(Serialize)]
struct Identity<'a> {
    methods: [&'a str; 1],
    password: Password<'a>,
}

#[derive(Serialize)]
struct Password<'a> {
    user: User<'a>,
}

#[derive(Serialize)]
struct User<'a> {
    name: &'a str,
    password: &'a str,
    domain: NameOrId<'a>,
}

#[derive(Serialize)]
struct Scope<'a> {
    project: Project<'a>,
}

#[derive(Serialize)]
struct Project<'a> {
    #[serde(flatten)]
    ident: NameOrId<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<NameOrId<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum NameOrId<'a> {
    Name(&'a str),
    Id(&'a str),
}

impl<'a> NameOrId<'a> {
    fn from_options(id: &'a Option<String>, name: &'a Option<String>) -> Self {
        match (id, name) {
            (Some(id), _) => NameOrId::Id(id),
            (None, Some(name)) => NameOrId::Name(name),
            (None, None) => NameOrId::Name("Default"),
        }
    }
}

// Keystone v3 response body, only the service catalog.

#[derive(Deserialize)]
struct TokenResponse {
    token: Token,
}

#[derive(Deserialize)]
struct Token {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Deserialize)]
struct Endpoint {
    interface: String,
    #[serde(default)]
    region_id: Option<String>,
    #[serde(default)]
    region: Option<String>,
    url: String,
}

#[derive(Deserialize)]
struct ContainerEntry {
    name: String,
}

fn auth_request<'a>(config: &'a StoreConfig, options: &'a OsOptions) -> AuthRequest<'a> {
    let scope = match (&options.project_id, &options.project_name) {
        (Some(id), _) => Some(Project {
            ident: NameOrId::Id(id),
            domain: None,
        }),
        (None, Some(name)) => Some(Project {
            ident: NameOrId::Name(name),
            domain: Some(NameOrId::from_options(
                &options.project_domain_id,
                &options.project_domain_name,
            )),
        }),
        (None, None) => None,
    };

    AuthRequest {
        auth: AuthBody {
            identity: Identity {
                methods: ["password"],
                password: Password {
                    user: User {
                        name: &config.user,
                        password: &config.key,
                        domain: NameOrId::from_options(
                            &options.user_domain_id,
                            &options.user_domain_name,
                        ),
                    },
                },
            },
            scope: scope.map(|project| Scope { project }),
        },
    }
}

/// Picks the object-store endpoint matching interface and region.
fn object_store_url(catalog: &[CatalogEntry], options: &OsOptions) -> Option<String> {
    let interface = options.endpoint_type.as_deref().unwrap_or("public");
    let interface = interface.strip_suffix("URL").unwrap_or(interface);

    catalog
        .iter()
        .filter(|entry| entry.service_type == "object-store")
        .flat_map(|entry| entry.endpoints.iter())
        .find(|endpoint| {
            endpoint.interface == interface
                && options.region_name.as_ref().is_none_or(|region| {
                    endpoint.region_id.as_ref() == Some(region)
                        || endpoint.region.as_ref() == Some(region)
                })
        })
        .map(|endpoint| endpoint.url.clone())
}

fn header(response: &reqwest::Response, name: &str) -> Result<String, Error> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| Error::Store(format!("auth response lacks {name} header")))
}

/// Builds `{storage_url}/{container}/{path...}` with every segment
/// percent-encoded, so `\` and `%` in names stay part of the segment.
fn object_url(storage_url: &str, container: &str, name: Option<&str>) -> Result<Url, Error> {
    let mut url = Url::parse(storage_url)
        .map_err(|e| Error::Store(format!("bad storage URL {storage_url:?}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| Error::Store(format!("storage URL {storage_url:?} cannot be a base")))?
        .pop_if_empty()
        .push(container)
        .extend(name.into_iter().flat_map(|name| name.split('/')));
    Ok(url)
}

impl Connection {
    /// Authenticates against the destination's auth endpoint.
    pub async fn connect(config: &StoreConfig) -> Result<Self, Error> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        let (storage_url, token) = match &config.auth {
            Auth::V1 { tenant_name } => Self::auth_v1(&client, config, tenant_name).await?,
            Auth::V3(options) => Self::auth_v3(&client, config, options).await?,
        };

        Ok(Self {
            client,
            storage_url: storage_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn auth_v1(
        client: &Client,
        config: &StoreConfig,
        tenant_name: &Option<String>,
    ) -> Result<(String, String), Error> {
        let user = match tenant_name {
            Some(tenant) => format!("{tenant}:{}", config.user),
            None => config.user.clone(),
        };

        let response = client
            .get(&config.authurl)
            .header("X-Auth-User", user)
            .header("X-Auth-Key", &config.key)
            .send()
            .await?
            .error_for_status()?;

        Ok((
            header(&response, "X-Storage-Url")?,
            header(&response, "X-Auth-Token")?,
        ))
    }

    async fn auth_v3(
        client: &Client,
        config: &StoreConfig,
        options: &OsOptions,
    ) -> Result<(String, String), Error> {
        let url = format!("{}/auth/tokens", config.authurl.trim_end_matches('/'));

        let response = client
            .post(url)
            .json(&auth_request(config, options))
            .send()
            .await?
            .error_for_status()?;

        let token = header(&response, "X-Subject-Token")?;
        let body: TokenResponse = response.json().await?;

        let storage_url = match &options.object_storage_url {
            Some(url) => url.clone(),
            None => object_store_url(&body.token.catalog, options)
                .ok_or_else(|| Error::Store("no object-store endpoint in catalog".to_string()))?,
        };

        Ok((storage_url, token))
    }

    /// Creates the container; succeeds if it already exists.
    pub async fn put_container(&self, container: &str) -> Result<(), Error> {
        self.client
            .put(object_url(&self.storage_url, container, None)?)
            .header("X-Auth-Token", &self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn put_object(&self, container: &str, name: &str, body: Vec<u8>) -> Result<(), Error> {
        self.client
            .put(object_url(&self.storage_url, container, Some(name))?)
            .header("X-Auth-Token", &self.token)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_RFC822)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Lists the container names of the account.
    pub async fn containers(&self) -> Result<Vec<String>, Error> {
        let response = self
            .client
            .get(format!("{}?format=json", self.storage_url))
            .header("X-Auth-Token", &self.token)
            .send()
            .await?
            .error_for_status()?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }

        let entries: Vec<ContainerEntry> = response.json().await?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }
}
