use std::collections::HashMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::Result;

/// Decode base64 with `-` standing in for `+` (the client's encoding for
/// account names and tokens).
fn decode_base64_dash(s: &str) -> Option<Vec<u8>> {
    let plain: String = s.chars().map(|c| if c == '-' { '+' } else { c }).collect();
    STANDARD.decode(plain).ok()
}

/// Filename of the tokens properties file inside the hashes root.
pub const TOKENS_FILE_NAME: &str = ".urbackup_tokens.properties";

/// Remote path of the tokens file on the client's file server.
pub fn remote_tokens_path(server_token: &str) -> String {
    format!("urbackup/tokens_{server_token}.properties")
}

/// A principal derived from the tokens file: a real user plus the groups
/// it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPrincipal {
    pub uid: i64,
    pub gids: Vec<i64>,
    pub account_name: String,
}

impl UserPrincipal {
    /// uid first, then gids: the id list permissions are checked against.
    pub fn ids(&self) -> Vec<i64> {
        let mut ids = Vec::with_capacity(1 + self.gids.len());
        ids.push(self.uid);
        ids.extend_from_slice(&self.gids);
        ids
    }

    /// Account name made safe for use as a directory name.
    pub fn view_folder_name(&self) -> String {
        self.account_name.replace(['/', '\\'], "_")
    }
}

/// Parsed `.urbackup_tokens.properties`: `key=value` lines with `uids`,
/// `real_uids`, `<uid>.accountname` (base64-dash), `<uid>.gids`,
/// `<id>.token` and `access_key` keys.
#[derive(Debug, Default)]
pub struct TokensFile {
    values: HashMap<String, String>,
}

impl TokensFile {
    pub fn parse(content: &str) -> Self {
        let mut values = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                values.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
        TokensFile { values }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn access_key(&self) -> Option<&str> {
        self.get("access_key").filter(|v| !v.is_empty())
    }

    fn id_list(&self, key: &str) -> Vec<i64> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .filter_map(|tok| tok.trim().parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All uids listed under `uids` (includes system accounts).
    pub fn uids(&self) -> Vec<i64> {
        self.id_list("uids")
    }

    fn principal(&self, uid: i64) -> UserPrincipal {
        let account_name = self
            .get(&format!("{uid}.accountname"))
            .and_then(decode_base64_dash)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        UserPrincipal {
            uid,
            gids: self.id_list(&format!("{uid}.gids")),
            account_name,
        }
    }

    /// Principals for the interactive users listed under `real_uids`,
    /// the ones that get user views.
    pub fn real_principals(&self) -> Vec<UserPrincipal> {
        self.id_list("real_uids")
            .into_iter()
            .map(|uid| self.principal(uid))
            .collect()
    }

    /// Principals for every uid, for the user/token dao rows.
    pub fn all_principals(&self) -> Vec<UserPrincipal> {
        self.uids()
            .into_iter()
            .map(|uid| self.principal(uid))
            .collect()
    }

    pub fn token_for(&self, id: i64) -> Option<&str> {
        self.get(&format!("{id}.token"))
    }

    /// Every `<id>.token` value in the file.
    pub fn all_tokens(&self) -> Vec<&str> {
        let mut tokens: Vec<(&str, &str)> = self
            .values
            .iter()
            .filter(|(k, _)| k.ends_with(".token"))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        tokens.sort();
        tokens.into_iter().map(|(_, v)| v).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    fn b64_dash(s: &str) -> String {
        STANDARD
            .encode(s.as_bytes())
            .chars()
            .map(|c| if c == '+' { '-' } else { c })
            .collect()
    }

    fn sample() -> String {
        format!(
            "uids=0,1000,1001\n\
             real_uids=1000,1001\n\
             1000.accountname={}\n\
             1000.gids=4,27\n\
             1000.token=tokA\n\
             1001.accountname={}\n\
             1001.token=tokB\n\
             4.token=tokG\n\
             access_key=secret1\n",
            b64_dash("alice"),
            b64_dash("bob/evil")
        )
    }

    #[test]
    fn parses_principals() {
        let tokens = TokensFile::parse(&sample());
        let principals = tokens.real_principals();
        assert_eq!(principals.len(), 2);

        assert_eq!(principals[0].uid, 1000);
        assert_eq!(principals[0].account_name, "alice");
        assert_eq!(principals[0].gids, vec![4, 27]);
        assert_eq!(principals[0].ids(), vec![1000, 4, 27]);

        assert_eq!(principals[1].account_name, "bob/evil");
        assert_eq!(principals[1].view_folder_name(), "bob_evil");
        assert!(principals[1].gids.is_empty());
    }

    #[test]
    fn uids_and_tokens() {
        let tokens = TokensFile::parse(&sample());
        assert_eq!(tokens.uids(), vec![0, 1000, 1001]);
        assert_eq!(tokens.token_for(1000), Some("tokA"));
        assert_eq!(tokens.token_for(2), None);
        assert_eq!(tokens.all_tokens(), vec!["tokA", "tokB", "tokG"]);
        assert_eq!(tokens.access_key(), Some("secret1"));
    }

    #[test]
    fn missing_keys_are_empty() {
        let tokens = TokensFile::parse("");
        assert!(tokens.uids().is_empty());
        assert!(tokens.real_principals().is_empty());
        assert!(tokens.access_key().is_none());
    }

    #[test]
    fn comments_and_blanks_ignored() {
        let tokens = TokensFile::parse("# comment\n\nuids=5\n");
        assert_eq!(tokens.uids(), vec![5]);
    }

    #[test]
    fn remote_path_carries_token() {
        assert_eq!(
            remote_tokens_path("srvtok"),
            "urbackup/tokens_srvtok.properties"
        );
    }
}
