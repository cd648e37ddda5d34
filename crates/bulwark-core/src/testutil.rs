//! In-memory fakes for the collaborator traits, shared by the unit tests.

use std::sync::Mutex;

use crate::client::BackupDao;
use crate::error::Result;
use crate::eta::DurationSample;
use bulwark_types::ContentHash;

#[derive(Debug, Clone, PartialEq)]
pub struct LinkRow {
    pub backup_id: i64,
    pub dest_path: String,
    pub hash: ContentHash,
    pub filesize: u64,
    pub rsize: i64,
    pub entry_id: i64,
    pub copied_file: bool,
}

/// Records every dao call in memory.
#[derive(Debug, Default)]
pub struct MemoryDao {
    pub backups: Mutex<Vec<(i64, String, bool)>>,
    pub link_rows: Mutex<Vec<LinkRow>>,
    pub completed: Mutex<Vec<i64>>,
    pub durations: Mutex<Vec<DurationSample>>,
    pub settings: Mutex<Vec<(String, String)>>,
    pub users: Mutex<Vec<String>>,
    pub user_tokens: Mutex<Vec<(String, String)>>,
    pub client_tokens: Mutex<Vec<String>>,
}

impl BackupDao for MemoryDao {
    fn new_file_backup(
        &self,
        client_id: i64,
        path: &str,
        incremental: bool,
        _group: i32,
    ) -> Result<i64> {
        let mut backups = self.backups.lock().unwrap();
        backups.push((client_id, path.to_string(), incremental));
        Ok(backups.len() as i64)
    }

    fn add_file_link(
        &self,
        backup_id: i64,
        _client_id: i64,
        dest_path: &str,
        _hash_path: &str,
        hash: &ContentHash,
        filesize: u64,
        rsize: i64,
        entry_id: i64,
        _entry_client_id: i64,
        _next_entry_id: i64,
        copied_file: bool,
    ) -> Result<()> {
        self.link_rows.lock().unwrap().push(LinkRow {
            backup_id,
            dest_path: dest_path.to_string(),
            hash: hash.clone(),
            filesize,
            rsize,
            entry_id,
            copied_file,
        });
        Ok(())
    }

    fn set_backup_complete(&self, backup_id: i64) -> Result<()> {
        self.completed.lock().unwrap().push(backup_id);
        Ok(())
    }

    fn update_client_last_file_backup(&self, _backup_id: i64, _client_id: i64) -> Result<()> {
        Ok(())
    }

    fn get_durations(&self, _client_id: i64) -> Result<Vec<DurationSample>> {
        Ok(self.durations.lock().unwrap().clone())
    }

    fn add_duration(&self, _client_id: i64, sample: DurationSample) -> Result<()> {
        self.durations.lock().unwrap().push(sample);
        Ok(())
    }

    fn update_or_insert_setting(&self, _client_id: i64, key: &str, value: &str) -> Result<()> {
        self.settings
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn delete_used_access_tokens(&self, _client_id: i64) -> Result<()> {
        Ok(())
    }

    fn delete_all_users_on_client(&self, _client_id: i64) -> Result<()> {
        self.users.lock().unwrap().clear();
        Ok(())
    }

    fn add_user_on_client(&self, _client_id: i64, account_name: &str) -> Result<()> {
        self.users.lock().unwrap().push(account_name.to_string());
        Ok(())
    }

    fn add_user_token(&self, account_name: &str, token: &str) -> Result<()> {
        self.user_tokens
            .lock()
            .unwrap()
            .push((account_name.to_string(), token.to_string()));
        Ok(())
    }

    fn add_client_token(&self, _client_id: i64, token: &str) -> Result<()> {
        self.client_tokens.lock().unwrap().push(token.to_string());
        Ok(())
    }
}
