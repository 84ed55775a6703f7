//! The image's own view of the workload: its embedded metadata and its
//! passwd/group databases.

use std::io;
use std::path::Path;

use vm_spec::{ImageMetadata, VmSpec};

use crate::config::paths;
use crate::error::{InitError, Result};
use crate::fs::Fs;

/// A passwd entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

/// Read the embedded metadata and turn it into the base spec.
pub fn base_spec(fs: &dyn Fs) -> Result<VmSpec> {
    let data = fs
        .read_file(Path::new(paths::METADATA))
        .map_err(InitError::io(paths::METADATA))?;
    let metadata = ImageMetadata::from_json(&data)?;
    let (uid, gid) = resolve_identity(fs, metadata.user())?;
    Ok(metadata.to_spec(uid, gid))
}

/// Resolve an OCI `user[:group]` string against the image.
///
/// Numeric parts are taken as ids. A numeric user missing from passwd runs
/// with gid 0; a named user or group that does not exist is an error.
pub fn resolve_identity(fs: &dyn Fs, spec: &str) -> Result<(u32, u32)> {
    if spec.is_empty() {
        return Ok((0, 0));
    }
    let (user, group) = match spec.split_once(':') {
        Some((user, group)) => (user, Some(group)),
        None => (spec, None),
    };

    let users = read_db(fs, paths::PASSWD, parse_passwd)?;
    let (uid, primary_gid) = match user.parse::<u32>() {
        Ok(uid) => (
            uid,
            users.iter().find(|u| u.uid == uid).map_or(0, |u| u.gid),
        ),
        Err(_) => users
            .iter()
            .find(|u| u.name == user)
            .map(|u| (u.uid, u.gid))
            .ok_or_else(|| InitError::User(format!("user {user:?} not found in image")))?,
    };

    let gid = match group {
        None | Some("") => primary_gid,
        Some(group) => match group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => read_db(fs, paths::GROUP, parse_group)?
                .into_iter()
                .find(|(name, _)| name == group)
                .map(|(_, gid)| gid)
                .ok_or_else(|| InitError::User(format!("group {group:?} not found in image")))?,
        },
    };
    Ok((uid, gid))
}

/// Look up a user by name.
pub fn find_user(fs: &dyn Fs, name: &str) -> Result<Option<User>> {
    Ok(read_db(fs, paths::PASSWD, parse_passwd)?
        .into_iter()
        .find(|u| u.name == name))
}

/// A missing database is empty.
fn read_db<T>(fs: &dyn Fs, path: &str, parse: fn(&str) -> Vec<T>) -> Result<Vec<T>> {
    match fs.read_to_string(Path::new(path)) {
        Ok(contents) => Ok(parse(&contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(InitError::io(path)(e)),
    }
}

fn records(contents: &str) -> impl Iterator<Item = Vec<&str>> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.split(':').collect())
}

fn parse_passwd(contents: &str) -> Vec<User> {
    records(contents)
        .filter_map(|fields| {
            Some(User {
                name: fields.first()?.to_string(),
                uid: fields.get(2)?.parse().ok()?,
                gid: fields.get(3)?.parse().ok()?,
                home: fields.get(5).map(|h| h.to_string()).unwrap_or_default(),
            })
        })
        .collect()
}

fn parse_group(contents: &str) -> Vec<(String, u32)> {
    records(contents)
        .filter_map(|fields| Some((fields.first()?.to_string(), fields.get(2)?.parse().ok()?)))
        .collect()
}
