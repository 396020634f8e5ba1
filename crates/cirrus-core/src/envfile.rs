//! Environment hand-off file delivered into the guest.

use crate::domain::GuestFile;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::collections::HashMap;

pub const ENV_FILE_PATH: &str = "/etc/profile.d/virt.sh";
pub const ENV_FILE_PERMS: &str = "777";

/// Render `env` as sorted `export KEY=VALUE` lines, base64 encoded.
/// An empty map produces no file.
pub fn env_file(env: &HashMap<String, String>) -> Option<GuestFile> {
    if env.is_empty() {
        return None;
    }

    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();

    let script = keys
        .iter()
        .map(|k| format!("export {k}={}", env[*k]))
        .collect::<Vec<_>>()
        .join("\n");

    Some(GuestFile {
        path: ENV_FILE_PATH.to_string(),
        permissions: ENV_FILE_PERMS.to_string(),
        encoding: "b64".to_string(),
        content: STANDARD.encode(script.as_bytes()),
    })
}

/// Replace the file with the same path, or append.
pub fn upsert_file(files: &mut Vec<GuestFile>, file: GuestFile) {
    match files.iter_mut().find(|f| f.path == file.path) {
        Some(existing) => *existing = file,
        None => files.push(file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_file_sorted_and_encoded() {
        let env = HashMap::from([
            ("VM_IP".to_string(), "192.168.254.10".to_string()),
            ("APP".to_string(), "web".to_string()),
            ("VM_CIDR".to_string(), "24".to_string()),
        ]);
        let file = env_file(&env).unwrap();
        assert_eq!(file.path, ENV_FILE_PATH);
        assert_eq!(file.permissions, "777");
        assert_eq!(file.encoding, "b64");

        let decoded = String::from_utf8(STANDARD.decode(&file.content).unwrap()).unwrap();
        assert_eq!(
            decoded,
            "export APP=web\nexport VM_CIDR=24\nexport VM_IP=192.168.254.10"
        );
    }

    #[test]
    fn test_empty_env_has_no_file() {
        assert!(env_file(&HashMap::new()).is_none());
    }

    #[test]
    fn test_upsert_replaces_by_path() {
        let mut files = vec![GuestFile {
            path: ENV_FILE_PATH.into(),
            permissions: "644".into(),
            encoding: String::new(),
            content: "old".into(),
        }];
        let env = HashMap::from([("A".to_string(), "1".to_string())]);
        upsert_file(&mut files, env_file(&env).unwrap());
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].permissions, "777");

        upsert_file(
            &mut files,
            GuestFile {
                path: "/etc/motd".into(),
                permissions: "644".into(),
                encoding: String::new(),
                content: "hi".into(),
            },
        );
        assert_eq!(files.len(), 2);
    }
}
