use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::Result;
use crate::filelist::{for_each_entry, EntryKind};
use crate::legalize::{legalize_filename, LegalizePolicy};
use crate::metadata::{dir_sidecar_path, file_sidecar_path, read_metadata, FileMetadata};
use crate::paths::BackupPath;
use crate::platform;
use crate::tokens::{TokensFile, UserPrincipal};

/// Per-directory counters for the identical-permission walk.
#[derive(Debug, Default, Clone, Copy)]
struct DirStatItem {
    has_perm: usize,
    id: usize,
    nodecount: usize,
    identicalcount: usize,
}

fn read_permissions(sidecar: &Path, what: &str) -> String {
    match read_metadata(sidecar) {
        Ok(meta) => meta.file_permissions,
        Err(e) => {
            warn!(path = what, error = %e, "error reading metadata");
            String::new()
        }
    }
}

fn count_allowed(permissions: &str, ids: &[i64]) -> usize {
    ids.iter()
        .filter(|&&id| {
            let mut denied = false;
            FileMetadata::has_permission(permissions, id, &mut denied)
        })
        .count()
}

/// First pass: find the directories whose whole subtree carries the same
/// access decision for this id set. Every entry gets an ordinal id; a
/// directory id lands in the result when, on leave, every node below it
/// matched its own permission count. Returned ids ascend.
pub fn find_identical_permission_roots(
    filelist: &Path,
    ids: &[i64],
    hashes_root: &Path,
    policy: LegalizePolicy,
) -> Result<Vec<usize>> {
    let mut reader = BufReader::new(File::open(filelist)?);

    let mut dir_stack: Vec<DirStatItem> = Vec::new();
    let mut folder_files: Vec<HashSet<String>> = vec![HashSet::new()];
    let mut curr_path = String::new();
    let mut curr_id = 0usize;
    let mut roots = Vec::new();

    for_each_entry(&mut reader, |entry| {
        match entry.kind {
            EntryKind::Dir => {
                let legal = legalize_filename(
                    &entry.name,
                    folder_files.last_mut().expect("stack never empty"),
                    policy,
                );
                folder_files.push(HashSet::new());
                if !curr_path.is_empty() {
                    curr_path.push('/');
                }
                curr_path.push_str(&legal.name);

                let permissions =
                    read_permissions(&dir_sidecar_path(hashes_root, &curr_path), &curr_path);
                dir_stack.push(DirStatItem {
                    has_perm: count_allowed(&permissions, ids),
                    id: curr_id,
                    nodecount: 0,
                    identicalcount: 0,
                });
            }
            EntryKind::UpDir => {
                if folder_files.len() > 1 {
                    folder_files.pop();
                }
                curr_path = match curr_path.rfind('/') {
                    Some(idx) => curr_path[..idx].to_string(),
                    None => String::new(),
                };

                if let Some(last_dir) = dir_stack.pop() {
                    if last_dir.nodecount == last_dir.identicalcount {
                        roots.push(last_dir.id);
                    }
                    if let Some(parent) = dir_stack.last_mut() {
                        parent.nodecount += last_dir.nodecount + 1;
                        parent.identicalcount += last_dir.identicalcount;
                        if last_dir.has_perm == parent.has_perm {
                            parent.identicalcount += 1;
                        }
                    }
                }
            }
            EntryKind::File => {
                let legal = legalize_filename(
                    &entry.name,
                    folder_files.last_mut().expect("stack never empty"),
                    policy,
                );
                let permissions = read_permissions(
                    &file_sidecar_path(hashes_root, &curr_path, &legal.name),
                    &legal.name,
                );
                let has_perm = count_allowed(&permissions, ids);
                if let Some(top) = dir_stack.last_mut() {
                    top.nodecount += 1;
                    if has_perm == top.has_perm {
                        top.identicalcount += 1;
                    }
                }
            }
        }
        curr_id += 1;
        Ok(())
    })?;

    roots.sort_unstable();
    Ok(roots)
}

/// Second pass: materialize the symlink tree for one principal set under
/// `<backup root>/user_views/<account>`, collapsing identical-permission
/// subtrees into one symlink, then publish the shared `<single>` and
/// `current` links under the backup folder.
#[allow(clippy::too_many_arguments)]
pub fn create_user_view(
    filelist: &Path,
    ids: &[i64],
    account_folder: &str,
    identical_roots: &[usize],
    paths: &BackupPath,
    backup_folder: &Path,
    client_name: &str,
    policy: LegalizePolicy,
) -> Result<()> {
    let view_home = paths.root.join("user_views").join(account_folder);
    std::fs::create_dir_all(&view_home)?;

    let mut reader = BufReader::new(File::open(filelist)?);
    let mut folder_files: Vec<HashSet<String>> = vec![HashSet::new()];
    let mut curr_path = String::new();
    let mut skip = 0usize;
    let mut id = 0usize;

    for_each_entry(&mut reader, |entry| {
        if skip > 0 {
            match entry.kind {
                EntryKind::Dir => skip += 1,
                EntryKind::UpDir => {
                    skip -= 1;
                    if skip == 0 {
                        folder_files.pop();
                        curr_path = match curr_path.rfind('/') {
                            Some(idx) => curr_path[..idx].to_string(),
                            None => String::new(),
                        };
                    }
                }
                EntryKind::File => {}
            }
            id += 1;
            return Ok(());
        }

        match entry.kind {
            EntryKind::Dir => {
                let legal = legalize_filename(
                    &entry.name,
                    folder_files.last_mut().expect("stack never empty"),
                    policy,
                );
                folder_files.push(HashSet::new());
                if !curr_path.is_empty() {
                    curr_path.push('/');
                }
                curr_path.push_str(&legal.name);

                let permissions = read_permissions(
                    &dir_sidecar_path(&paths.hashes_root, &curr_path),
                    &curr_path,
                );
                if count_allowed(&permissions, ids) > 0 {
                    if identical_roots.binary_search(&id).is_ok() {
                        platform::create_symlink(
                            &paths.root.join(&curr_path),
                            &view_home.join(&curr_path),
                        )?;
                        skip = 1;
                    } else {
                        std::fs::create_dir(view_home.join(&curr_path))?;
                    }
                } else {
                    skip = 1;
                }
            }
            EntryKind::UpDir => {
                if folder_files.len() > 1 {
                    folder_files.pop();
                }
                curr_path = match curr_path.rfind('/') {
                    Some(idx) => curr_path[..idx].to_string(),
                    None => String::new(),
                };
            }
            EntryKind::File => {
                let legal = legalize_filename(
                    &entry.name,
                    folder_files.last_mut().expect("stack never empty"),
                    policy,
                );
                let rel = if curr_path.is_empty() {
                    legal.name.clone()
                } else {
                    format!("{curr_path}/{}", legal.name)
                };
                let permissions = read_permissions(
                    &file_sidecar_path(&paths.hashes_root, &curr_path, &legal.name),
                    &rel,
                );
                if count_allowed(&permissions, ids) > 0 {
                    platform::create_symlink(&paths.root.join(&rel), &view_home.join(&rel))?;
                }
            }
        }
        id += 1;
        Ok(())
    })?;

    // Shared links: <backup_folder>/user_views/<client>/<account>/<single>
    // plus an atomically re-targeted `current`.
    let shared_folder = backup_folder
        .join("user_views")
        .join(client_name)
        .join(account_folder);
    std::fs::create_dir_all(&shared_folder)?;
    platform::create_symlink(&view_home, &shared_folder.join(&paths.single))?;
    platform::retarget_symlink(&view_home, &shared_folder.join("current"))?;

    Ok(())
}

/// Build views for every real user named by the tokens file. Missing
/// tokens file means no views; per-user failures are warnings.
pub fn create_user_views(
    filelist: &Path,
    tokens: Option<&TokensFile>,
    paths: &BackupPath,
    backup_folder: &Path,
    client_name: &str,
    policy: LegalizePolicy,
) {
    let Some(tokens) = tokens else {
        warn!("cannot create user views, token file not present");
        return;
    };

    for principal in tokens.real_principals() {
        if let Err(e) = create_view_for_principal(
            filelist,
            &principal,
            paths,
            backup_folder,
            client_name,
            policy,
        ) {
            warn!(uid = principal.uid, error = %e, "error creating user view");
        }
    }
}

fn create_view_for_principal(
    filelist: &Path,
    principal: &UserPrincipal,
    paths: &BackupPath,
    backup_folder: &Path,
    client_name: &str,
    policy: LegalizePolicy,
) -> Result<()> {
    let ids = principal.ids();
    let roots = find_identical_permission_roots(filelist, &ids, &paths.hashes_root, policy)?;
    debug!(
        uid = principal.uid,
        roots = roots.len(),
        "identical permission roots found"
    );
    create_user_view(
        filelist,
        &ids,
        &principal.view_folder_name(),
        &roots,
        paths,
        backup_folder,
        client_name,
        policy,
    )
}
