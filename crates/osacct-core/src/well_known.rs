//! Fixed Windows identities: special service accounts, group SIDs that never
//! name a user, and the localized realm/login spellings of the built-in
//! accounts.

use crate::error::ContractError;
use crate::model::eq_ignore_case;
use regex::Regex;
use std::sync::OnceLock;

/// Realm address shared by all special Windows accounts on a host.
pub const SPECIAL_WINDOWS_REALM_ADDR: &str = "SPECIAL_WINDOWS_ACCOUNTS";
pub const BACKUP_POSTFIX: &str = ".bak";

const DOMAIN_SID_PREFIX: &str = "S-1-5";

const SPECIAL_SIDS: [(&str, &str); 3] = [
    ("S-1-5-18", "Local System Account"),
    ("S-1-5-19", "Local Service Account"),
    ("S-1-5-20", "Network Service Account"),
];

const SPECIAL_SID_PREFIXES: [(&str, &str); 6] = [
    ("S-1-5-80", "Service Virtual Account"),
    ("S-1-5-82", "IIS AppPool Virtual Account"),
    ("S-1-5-83", "Virtual Machine Virtual Account"),
    ("S-1-5-90", "Window Manager Virtual Account"),
    ("S-1-5-94", "WinRM Virtual Account"),
    ("S-1-5-96", "Font Driver Host Virtual Account"),
];

const VIRTUAL_ACCOUNT_SUB_AUTHORITIES: std::ops::RangeInclusive<u32> = 80..=111;

const GROUP_SIDS: [&str; 21] = [
    "S-1-0-0",  // null
    "S-1-1-0",  // everyone
    "S-1-2-0",  // local
    "S-1-2-1",  // console logon
    "S-1-3-1",  // creator group
    "S-1-3-4",  // owner rights
    "S-1-5-1",  // dialup
    "S-1-5-2",  // network
    "S-1-5-3",  // batch
    "S-1-5-4",  // interactive
    "S-1-5-6",  // service
    "S-1-5-7",  // anonymous
    "S-1-5-9",  // enterprise domain controllers
    "S-1-5-11", // authenticated users
    "S-1-5-12", // restricted code
    "S-1-5-13", // terminal server users
    "S-1-5-14", // remote interactive logon
    "S-1-5-15", // this organization
    "S-1-5-80-0",
    "S-1-5-83-0",
    "S-1-5-90-0",
];

const GROUP_SID_PREFIXES: [&str; 2] = [
    "S-1-5-32", // builtin
    "S-1-5-87", // task ids
];

const DOMAIN_GROUP_RIDS: [&str; 17] = [
    "512", "513", "514", "515", "516", "517", "518", "519", "520", "526", "527", "533", "498",
    "521", "571", "572", "522",
];

const WELL_KNOWN_USER_RIDS: [(&str, &str); 4] = [
    ("500", "Built-in Administrator"),
    ("501", "Built-in Guest"),
    ("503", "Default Account"),
    ("504", "Windows Defender Application Guard Account"),
];

const NT_AUTHORITY_NAMES: [&str; 6] = [
    "NT AUTHORITY",
    "NT-AUTORITÄT",
    "AUTORITE NT",
    "AUTORITÉ NT",
    "AUTORIDAD NT",
    "NT INSTANS",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WellKnownAccount {
    pub sid: &'static str,
    pub login_name: &'static str,
    pub localized_logins: &'static [&'static str],
    pub full_name: &'static str,
}

impl WellKnownAccount {
    pub fn matches_login(&self, login: &str) -> bool {
        eq_ignore_case(self.login_name, login)
            || self
                .localized_logins
                .iter()
                .any(|alias| eq_ignore_case(alias, login))
    }
}

const WELL_KNOWN_ACCOUNTS: [WellKnownAccount; 3] = [
    WellKnownAccount {
        sid: "S-1-5-18",
        login_name: "SYSTEM",
        localized_logins: &["SYSTÈME", "SISTEMA"],
        full_name: "Local System Account",
    },
    WellKnownAccount {
        sid: "S-1-5-19",
        login_name: "LOCAL SERVICE",
        localized_logins: &["LOKALER DIENST", "SERVICE LOCAL", "SERVICIO LOCAL"],
        full_name: "Local Service Account",
    },
    WellKnownAccount {
        sid: "S-1-5-20",
        login_name: "NETWORK SERVICE",
        localized_logins: &["NETZWERKDIENST", "SERVICE RÉSEAU", "SERVICIO DE RED"],
        full_name: "Network Service Account",
    },
];

fn sid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)^S-1-\d+(-\d+)*$").expect("valid SID regex"))
}

pub fn strip_backup_postfix(sid: &str) -> &str {
    sid.strip_suffix(BACKUP_POSTFIX).unwrap_or(sid)
}

/// True for strings that look like `S-1-<authority>-<sub>...`, ignoring a backup postfix.
pub fn is_sid_shaped(value: &str) -> bool {
    sid_pattern().is_match(strip_backup_postfix(value))
}

fn has_component_prefix(sid: &str, prefix: &str) -> bool {
    let sid = sid.as_bytes();
    let prefix = prefix.as_bytes();
    sid.len() >= prefix.len()
        && sid[..prefix.len()].eq_ignore_ascii_case(prefix)
        && (sid.len() == prefix.len() || sid[prefix.len()] == b'-')
}

fn has_component_suffix(sid: &str, suffix: &str) -> bool {
    sid.rsplit('-').next() == Some(suffix)
}

pub fn is_windows_special_sid(sid: &str) -> bool {
    let sid = strip_backup_postfix(sid);
    if SPECIAL_SIDS
        .iter()
        .any(|(special, _)| special.eq_ignore_ascii_case(sid))
    {
        return true;
    }
    if SPECIAL_SID_PREFIXES
        .iter()
        .any(|(prefix, _)| has_component_prefix(sid, prefix))
    {
        return true;
    }

    if !has_component_prefix(sid, DOMAIN_SID_PREFIX) {
        return false;
    }
    sid[DOMAIN_SID_PREFIX.len()..]
        .trim_start_matches('-')
        .split('-')
        .next()
        .and_then(|sub_authority| sub_authority.parse::<u32>().ok())
        .is_some_and(|sub_authority| VIRTUAL_ACCOUNT_SUB_AUTHORITIES.contains(&sub_authority))
}

pub fn special_sid_name(sid: &str) -> Option<&'static str> {
    let sid = strip_backup_postfix(sid);
    SPECIAL_SIDS
        .iter()
        .find(|(special, _)| special.eq_ignore_ascii_case(sid))
        .or_else(|| {
            SPECIAL_SID_PREFIXES
                .iter()
                .find(|(prefix, _)| has_component_prefix(sid, prefix))
        })
        .map(|(_, name)| *name)
}

/// False for group SIDs, which name a set of principals rather than one user.
pub fn is_windows_user_sid(sid: &str) -> bool {
    let sid = strip_backup_postfix(sid);
    if GROUP_SIDS.iter().any(|group| group.eq_ignore_ascii_case(sid)) {
        return false;
    }
    if GROUP_SID_PREFIXES
        .iter()
        .any(|prefix| has_component_prefix(sid, prefix))
    {
        return false;
    }
    if has_component_prefix(sid, DOMAIN_SID_PREFIX)
        && DOMAIN_GROUP_RIDS
            .iter()
            .any(|rid| has_component_suffix(sid, rid))
    {
        return false;
    }
    true
}

/// Rejects SIDs that cannot own an account.
pub fn check_user_sid(sid: &str) -> Result<(), ContractError> {
    if !is_sid_shaped(sid) {
        return Err(ContractError::InvalidSid {
            sid: sid.to_string(),
            reason: "not a SID",
        });
    }
    if !is_windows_user_sid(sid) {
        return Err(ContractError::NotAUserIdentity {
            sid: sid.to_string(),
        });
    }
    Ok(())
}

/// Address of the realm that issued `sid`.
///
/// Special accounts share [`SPECIAL_WINDOWS_REALM_ADDR`]; everything else
/// drops the final sub-authority (the RID).
pub fn windows_realm_address(sid: &str) -> Result<String, ContractError> {
    let stripped = strip_backup_postfix(sid);
    if is_windows_special_sid(stripped) || stripped == SPECIAL_WINDOWS_REALM_ADDR {
        return Ok(SPECIAL_WINDOWS_REALM_ADDR.to_string());
    }
    if stripped.matches('-').count() < 4 {
        return Err(ContractError::InvalidSid {
            sid: sid.to_string(),
            reason: "a host or domain SID needs at least five components",
        });
    }
    match stripped.rfind('-') {
        Some(index) => Ok(stripped[..index].to_string()),
        None => Err(ContractError::InvalidSid {
            sid: sid.to_string(),
            reason: "missing relative identifier",
        }),
    }
}

pub fn well_known_account_by_sid(sid: &str) -> Option<&'static WellKnownAccount> {
    let sid = strip_backup_postfix(sid);
    WELL_KNOWN_ACCOUNTS
        .iter()
        .find(|account| account.sid.eq_ignore_ascii_case(sid))
}

/// Looks up a built-in account by realm name and login, e.g. `NT AUTHORITY\SYSTEM`.
///
/// A missing realm name matches any spelling of `NT AUTHORITY`.
pub fn well_known_account_for(
    realm_name: Option<&str>,
    login: &str,
) -> Option<&'static WellKnownAccount> {
    if let Some(realm_name) = realm_name {
        if !is_nt_authority(realm_name) {
            return None;
        }
    }
    WELL_KNOWN_ACCOUNTS
        .iter()
        .find(|account| account.matches_login(login))
}

pub fn is_nt_authority(realm_name: &str) -> bool {
    NT_AUTHORITY_NAMES
        .iter()
        .any(|name| eq_ignore_case(name, realm_name.trim()))
}

/// Display name for an identity whose meaning is fixed by the OS.
pub fn well_known_full_name(sid: &str) -> Option<&'static str> {
    if let Some(name) = special_sid_name(sid) {
        return Some(name);
    }
    let sid = strip_backup_postfix(sid);
    if !has_component_prefix(sid, "S-1-5-21") {
        return None;
    }
    WELL_KNOWN_USER_RIDS
        .iter()
        .find(|(rid, _)| has_component_suffix(sid, rid))
        .map(|(_, name)| *name)
}
