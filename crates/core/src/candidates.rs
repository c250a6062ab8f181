use std::collections::HashSet;
use std::env;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_PORT: &str = "5432";

pub const PRIVATE_URL_VAR: &str = "DATABASE_PRIVATE_URL";
pub const PUBLIC_URL_VAR: &str = "DATABASE_URL";
pub const USER_VAR: &str = "PGUSER";
pub const PASSWORD_VAR: &str = "PGPASSWORD";
pub const HOST_VAR: &str = "PGHOST";
pub const PORT_VAR: &str = "PGPORT";
pub const DATABASE_VAR: &str = "PGDATABASE";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    ManualOverride,
    PrivateEnv,
    ConstructedPrivate,
    PublicEnv,
}

impl SourceTier {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::ManualOverride => "MANUAL_OVERRIDE",
            Self::PrivateEnv => "PRIVATE_ENV",
            Self::ConstructedPrivate => "CONSTRUCTED_PRIVATE",
            Self::PublicEnv => "PUBLIC_ENV",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TlsVariant {
    Raw,
    Prefer,
    RequireNoVerify,
}

impl TlsVariant {
    pub const ALL: [Self; 3] = [Self::Raw, Self::Prefer, Self::RequireNoVerify];

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Raw => "RAW",
            Self::Prefer => "SSL_PREFER",
            Self::RequireNoVerify => "SSL_NO_VERIFY",
        }
    }

    #[must_use]
    pub fn query_suffix(self) -> Option<&'static str> {
        match self {
            Self::Raw => None,
            Self::Prefer => Some("sslmode=prefer"),
            // `require` encrypts without verifying the server certificate.
            Self::RequireNoVerify => Some("sslmode=require"),
        }
    }

    #[must_use]
    pub fn apply(self, base: &str) -> String {
        let Some(suffix) = self.query_suffix() else {
            return base.to_string();
        };
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{base}{separator}{suffix}")
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionDescriptor(String);

impl ConnectionDescriptor {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn redacted(&self) -> String {
        match Url::parse(&self.0) {
            Ok(mut parsed) => {
                if parsed.password().is_some() && parsed.set_password(Some("***")).is_err() {
                    return "<unparseable descriptor>".to_string();
                }
                parsed.to_string()
            }
            Err(_) => "<unparseable descriptor>".to_string(),
        }
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionDescriptor")
            .field(&self.redacted())
            .finish()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateTarget {
    name: String,
    tier: SourceTier,
    variant: Option<TlsVariant>,
    descriptor: ConnectionDescriptor,
}

impl CandidateTarget {
    fn manual(descriptor: &str) -> Self {
        Self {
            name: SourceTier::ManualOverride.label().to_string(),
            tier: SourceTier::ManualOverride,
            variant: None,
            descriptor: ConnectionDescriptor::new(descriptor),
        }
    }

    fn variant_of(tier: SourceTier, variant: TlsVariant, base: &str) -> Self {
        Self {
            name: format!("{}_{}", tier.label(), variant.label()),
            tier,
            variant: Some(variant),
            descriptor: ConnectionDescriptor::new(variant.apply(base)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn tier(&self) -> SourceTier {
        self.tier
    }

    #[must_use]
    pub fn variant(&self) -> Option<TlsVariant> {
        self.variant
    }

    #[must_use]
    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscreteParts {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub database: Option<String>,
}

impl DiscreteParts {
    #[must_use]
    pub fn compose(&self) -> Option<String> {
        let user = non_empty(self.user.as_deref())?;
        let host = non_empty(self.host.as_deref())?;
        let database = non_empty(self.database.as_deref())?;
        let password = urlencoding::encode(self.password.as_deref().unwrap_or_default());
        let port = non_empty(self.port.as_deref()).unwrap_or(DEFAULT_PORT);
        Some(format!(
            "postgresql://{user}:{password}@{host}:{port}/{database}"
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvInputs {
    pub private_url: Option<String>,
    pub parts: DiscreteParts,
    pub public_url: Option<String>,
}

impl EnvInputs {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Self {
            private_url: read(PRIVATE_URL_VAR),
            parts: DiscreteParts {
                user: read(USER_VAR),
                password: read(PASSWORD_VAR),
                host: read(HOST_VAR),
                port: read(PORT_VAR),
                database: read(DATABASE_VAR),
            },
            public_url: read(PUBLIC_URL_VAR),
        }
    }

    #[must_use]
    pub fn from_process_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }
}

pub trait InputSource: Send + Sync {
    fn load(&self) -> EnvInputs;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl InputSource for ProcessEnv {
    fn load(&self) -> EnvInputs {
        EnvInputs::from_process_env()
    }
}

impl InputSource for EnvInputs {
    fn load(&self) -> EnvInputs {
        self.clone()
    }
}

#[must_use]
pub fn generate_candidates(
    manual_override: Option<&str>,
    inputs: &EnvInputs,
) -> Vec<CandidateTarget> {
    let mut candidates = Vec::new();

    if let Some(descriptor) = non_empty(manual_override) {
        candidates.push(CandidateTarget::manual(descriptor));
    }

    let tiers = [
        (
            SourceTier::PrivateEnv,
            non_empty(inputs.private_url.as_deref()).map(str::to_string),
        ),
        (SourceTier::ConstructedPrivate, inputs.parts.compose()),
        (
            SourceTier::PublicEnv,
            non_empty(inputs.public_url.as_deref()).map(str::to_string),
        ),
    ];
    for (tier, base) in tiers {
        let Some(base) = base else {
            continue;
        };
        candidates.extend(
            TlsVariant::ALL
                .iter()
                .map(|variant| CandidateTarget::variant_of(tier, *variant, &base)),
        );
    }

    let mut seen = HashSet::new();
    candidates.retain(|candidate| seen.insert(candidate.descriptor.clone()));
    candidates
}

#[must_use]
pub fn candidate_names(candidates: &[CandidateTarget]) -> Vec<String> {
    candidates
        .iter()
        .map(|candidate| candidate.name().to_string())
        .collect()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    })
}
