// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Board configuration for process loading, read from TOML.
//!
//! ```toml
//! [loader]
//! max-processes = 8
//! short-id-collision = "renumber"
//!
//! [credentials]
//! require = true
//! accept = ["sha256", "ecdsa-p256"]
//! keys = ["<128 hex digits: x || y>"]
//!
//! [identity]
//! policy = "table"
//! table = { blinky = 0x200, ping = 0x201 }
//!
//! [fault]
//! policy = "threshold"
//! limit = 3
//! then = "terminate"
//! ```
//!
//! Every table is optional. An empty file gives the permissive defaults:
//! accept unverified images, name them by package name, restart on fault.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use kern::config::LoaderConfig;
use kern::creds::{CheckPolicy, CredentialClass};
use kern::crypto::{HashAlgorithm, RawP256Key};
use kern::fault::{
    Action, FaultPolicy, HaltOnFault, RestartWithDump, StopWithSummary,
    TerminateImmediately, ThresholdRestart,
};
use kern::ident::{
    CredentialKey, HeaderShortId, IdentityPolicy, KeyNibbleName, NameHash,
    StaticTable,
};
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    loader: LoaderConfig,
    #[serde(default)]
    credentials: RawCredentials,
    #[serde(default)]
    identity: RawIdentity,
    #[serde(default)]
    fault: RawFault,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawCredentials {
    #[serde(default)]
    require: bool,
    #[serde(default)]
    accept: Vec<Accept>,
    #[serde(default)]
    keys: Vec<String>,
}

/// A credential class named in `[credentials] accept`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Accept {
    Sha256,
    Sha384,
    Sha512,
    EcdsaP256,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawIdentity {
    #[serde(default)]
    policy: IdentityKind,
    #[serde(default)]
    table: BTreeMap<String, u32>,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityKind {
    #[default]
    NameHash,
    KeyNibble,
    CredentialKey,
    Header,
    Table,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawFault {
    #[serde(default)]
    policy: FaultKind,
    limit: Option<u32>,
    then: Option<Action>,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultKind {
    #[default]
    Restart,
    Stop,
    Terminate,
    Halt,
    Threshold,
}

/// A checked board configuration. Policies that borrow keys or tables
/// borrow them from here.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub loader: LoaderConfig,
    pub require_credentials: bool,
    pub accept: Vec<Accept>,
    pub keys: Vec<RawP256Key>,
    pub identity: IdentityKind,
    pub table: Vec<(String, u32)>,
    fault: FaultChoice,
}

#[derive(Copy, Clone, Debug)]
enum FaultChoice {
    Fixed(FaultKind),
    Threshold(ThresholdRestart),
}

impl AppConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(text).context("parsing loader configuration")?;

        let keys = raw
            .credentials
            .keys
            .iter()
            .enumerate()
            .map(|(i, k)| parse_key(k).with_context(|| format!("key {i}")))
            .collect::<Result<Vec<_>>>()?;

        if raw.credentials.accept.contains(&Accept::EcdsaP256) && keys.is_empty()
        {
            bail!("ecdsa-p256 is accepted but no keys are configured");
        }
        if raw.credentials.require && raw.credentials.accept.is_empty() {
            bail!("credentials are required but no class is accepted");
        }

        let identity = raw.identity.policy;
        match identity {
            IdentityKind::CredentialKey if keys.is_empty() => {
                bail!("identity policy credential-key needs signing keys");
            }
            IdentityKind::Table if raw.identity.table.is_empty() => {
                bail!("identity policy table needs a non-empty table");
            }
            IdentityKind::Table => (),
            _ if !raw.identity.table.is_empty() => {
                bail!("identity table given but policy is {identity:?}");
            }
            _ => (),
        }

        let fault = match (raw.fault.policy, raw.fault.limit, raw.fault.then) {
            (FaultKind::Threshold, Some(limit), then) => {
                FaultChoice::Threshold(ThresholdRestart {
                    limit,
                    then: then.unwrap_or(Action::Stop),
                })
            }
            (FaultKind::Threshold, None, _) => {
                bail!("fault policy threshold needs a limit");
            }
            (kind, None, None) => FaultChoice::Fixed(kind),
            (kind, _, _) => {
                bail!("limit and then only apply to threshold, not {kind:?}");
            }
        };

        if raw.loader.max_processes == 0 {
            bail!("max-processes must be at least 1");
        }

        Ok(Self {
            loader: raw.loader,
            require_credentials: raw.credentials.require,
            accept: raw.credentials.accept,
            keys,
            identity,
            table: raw.identity.table.into_iter().collect(),
            fault,
        })
    }

    /// The accepted credential classes, in the order configured. Hand the
    /// result to [`AppConfig::check_policy`].
    pub fn credential_classes(&self) -> Vec<CredentialClass<'_>> {
        self.accept
            .iter()
            .map(|a| match a {
                Accept::Sha256 => CredentialClass::Hash(HashAlgorithm::Sha256),
                Accept::Sha384 => CredentialClass::Hash(HashAlgorithm::Sha384),
                Accept::Sha512 => CredentialClass::Hash(HashAlgorithm::Sha512),
                Accept::EcdsaP256 => CredentialClass::EcdsaP256 {
                    keys: &self.keys,
                },
            })
            .collect()
    }

    pub fn check_policy<'a>(
        &self,
        classes: &'a [CredentialClass<'a>],
    ) -> CheckPolicy<'a> {
        CheckPolicy {
            accepted: classes,
            require_credentials: self.require_credentials,
        }
    }

    pub fn identity_policy(&self) -> Box<dyn IdentityPolicy + '_> {
        match self.identity {
            IdentityKind::NameHash => Box::new(NameHash),
            IdentityKind::KeyNibble => Box::new(KeyNibbleName),
            IdentityKind::CredentialKey => {
                Box::new(CredentialKey { keys: &self.keys })
            }
            IdentityKind::Header => Box::new(HeaderShortId),
            IdentityKind::Table => Box::new(StaticTable {
                entries: &self.table,
            }),
        }
    }

    pub fn fault_policy(&self) -> Box<dyn FaultPolicy> {
        match self.fault {
            FaultChoice::Threshold(t) => Box::new(t),
            FaultChoice::Fixed(FaultKind::Restart) => Box::new(RestartWithDump),
            FaultChoice::Fixed(FaultKind::Stop) => Box::new(StopWithSummary),
            FaultChoice::Fixed(FaultKind::Terminate) => {
                Box::new(TerminateImmediately)
            }
            FaultChoice::Fixed(FaultKind::Halt) => Box::new(HaltOnFault),
            // Rejected by `from_toml`.
            FaultChoice::Fixed(FaultKind::Threshold) => Box::new(RestartWithDump),
        }
    }
}

/// Accepts a raw `x || y` key, or the same with the SEC1 `04` prefix.
fn parse_key(text: &str) -> Result<RawP256Key> {
    let bytes = hex::decode(text.trim()).context("key is not hex")?;
    let raw = match bytes.as_slice() {
        [0x04, rest @ ..] if rest.len() == 64 => rest,
        all if all.len() == 64 => all,
        other => bail!("key is {} bytes, expected 64", other.len()),
    };
    let mut key = [0u8; 64];
    key.copy_from_slice(raw);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kern::config::CollisionPolicy;

    const KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101\
                       0202020202020202020202020202020202020202020202020202020202020202";

    #[test]
    fn empty_file_is_permissive() {
        let cfg = AppConfig::from_toml("").unwrap();
        assert_eq!(cfg.loader, LoaderConfig::DEFAULT);
        assert!(!cfg.require_credentials);
        assert!(cfg.credential_classes().is_empty());
        assert_eq!(cfg.identity, IdentityKind::NameHash);
    }

    #[test]
    fn full_file() {
        let text = format!(
            r#"
            [loader]
            max-processes = 4
            kernel-reserve = 64
            short-id-collision = "renumber"
            kernel-version = {{ major = 2, minor = 1 }}
            check-poll-budget = 10
            trace-scan = true

            [credentials]
            require = true
            accept = ["sha512", "ecdsa-p256"]
            keys = ["04{KEY}"]

            [identity]
            policy = "credential-key"

            [fault]
            policy = "threshold"
            limit = 2
            then = "halt-all"
            "#
        );
        let cfg = AppConfig::from_toml(&text).unwrap();
        assert_eq!(cfg.loader.max_processes, 4);
        assert_eq!(cfg.loader.kernel_reserve, 64);
        assert_eq!(cfg.loader.short_id_collision, CollisionPolicy::Renumber);
        assert_eq!(cfg.loader.kernel_version.minor, 1);
        assert!(cfg.loader.trace_scan);
        assert_eq!(cfg.keys.len(), 1);
        assert_eq!(cfg.keys[0][0], 1);
        assert_eq!(cfg.keys[0][63], 2);

        let classes = cfg.credential_classes();
        assert_eq!(classes[0], CredentialClass::Hash(HashAlgorithm::Sha512));
        assert!(matches!(
            classes[1],
            CredentialClass::EcdsaP256 { keys } if keys.len() == 1
        ));
        let policy = cfg.check_policy(&classes);
        assert!(policy.require_credentials);
        assert!(matches!(
            cfg.fault,
            FaultChoice::Threshold(ThresholdRestart {
                limit: 2,
                then: Action::HaltAll
            })
        ));
    }

    #[test]
    fn table_identity() {
        let cfg = AppConfig::from_toml(
            r#"
            [identity]
            policy = "table"
            table = { blinky = 0x200, ping = 513 }
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.table,
            vec![("blinky".to_string(), 0x200), ("ping".to_string(), 513)]
        );
        let _ = cfg.identity_policy();
    }

    #[test]
    fn inconsistent_files_are_refused() {
        for text in [
            "[loader]\nmax-processes = 0",
            "[loader]\nbogus = 1",
            "[credentials]\naccept = [\"ecdsa-p256\"]",
            "[credentials]\nrequire = true",
            "[credentials]\nkeys = [\"abcd\"]",
            "[credentials]\nkeys = [\"zz\"]",
            "[identity]\npolicy = \"credential-key\"",
            "[identity]\npolicy = \"table\"",
            "[identity]\ntable = { a = 1 }",
            "[fault]\npolicy = \"threshold\"",
            "[fault]\npolicy = \"stop\"\nlimit = 3",
            "[fault]\npolicy = \"sometimes\"",
        ] {
            assert!(AppConfig::from_toml(text).is_err(), "accepted: {text}");
        }
    }
}
