//! OS-keychain-backed token store.
//!
//! macOS uses the `security` CLI, Windows writes through `cmdkey` and reads
//! through the PowerShell `PasswordVault` API, and everything else falls
//! back to a user-only file under `$HOME/.manifold/tokens/`. External
//! commands always receive argument arrays; nothing is ever interpolated
//! into a shell string, and the server identifier is validated up front so
//! it can never smuggle arguments.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::debug;

use crate::error::{AuthError, AuthResult};
use crate::store::TokenStore;
use crate::types::TokenData;

static SERVER_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").expect("static pattern"));

const SERVICE_PREFIX: &str = "manifold-mcp";
const ACCOUNT: &str = "manifold";

/// Token store backed by the operating system's secret storage.
#[derive(Debug, Clone)]
pub struct KeychainTokenStore {
    server_id: String,
    service: String,
    /// Directory for the file fallback; defaults to `$HOME/.manifold/tokens`
    fallback_dir: PathBuf,
}

impl KeychainTokenStore {
    /// Create a store for one downstream server's credentials.
    ///
    /// # Errors
    ///
    /// Fails when `server_id` does not match `^[A-Za-z0-9_.-]{1,64}$` or no
    /// home directory can be determined for the file fallback.
    pub fn new(server_id: &str) -> AuthResult<Self> {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .map_err(|_| AuthError::Storage("no home directory for token storage".to_string()))?;
        Self::with_fallback_dir(server_id, PathBuf::from(home).join(".manifold").join("tokens"))
    }

    /// Create a store with an explicit file-fallback directory.
    pub fn with_fallback_dir(server_id: &str, fallback_dir: PathBuf) -> AuthResult<Self> {
        if !SERVER_ID_RE.is_match(server_id) {
            return Err(AuthError::Config(format!(
                "invalid server identifier for token storage: {server_id:?}"
            )));
        }
        Ok(Self {
            server_id: server_id.to_string(),
            service: format!("{SERVICE_PREFIX}:{server_id}"),
            fallback_dir,
        })
    }

    fn fallback_path(&self) -> PathBuf {
        let digest = Sha256::digest(self.server_id.as_bytes());
        let mut name = String::with_capacity(64);
        for byte in digest {
            name.push_str(&format!("{byte:02x}"));
        }
        self.fallback_dir.join(name)
    }

    async fn file_store(&self, payload: &str) -> AuthResult<()> {
        let dir = self.fallback_dir.clone();
        let path = self.fallback_path();
        let payload = payload.to_string();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
            }
            std::fs::write(&path, payload)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| AuthError::Storage(e.to_string()))?
        .map_err(|e| AuthError::Storage(e.to_string()))
    }

    async fn file_retrieve(&self) -> AuthResult<Option<String>> {
        let path = self.fallback_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AuthError::Storage(e.to_string())),
        }
    }

    async fn file_clear(&self) -> AuthResult<()> {
        match tokio::fs::remove_file(self.fallback_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthError::Storage(e.to_string())),
        }
    }

    #[cfg(target_os = "macos")]
    async fn platform_store(&self, payload: &str) -> AuthResult<()> {
        run_checked(
            "security",
            &[
                "add-generic-password",
                "-U",
                "-a",
                ACCOUNT,
                "-s",
                &self.service,
                "-w",
                payload,
            ],
        )
        .await
        .map(|_| ())
    }

    #[cfg(target_os = "macos")]
    async fn platform_retrieve(&self) -> AuthResult<Option<String>> {
        match run_checked(
            "security",
            &["find-generic-password", "-a", ACCOUNT, "-s", &self.service, "-w"],
        )
        .await
        {
            Ok(output) => Ok(Some(output.trim_end().to_string())),
            Err(_) => Ok(None),
        }
    }

    #[cfg(target_os = "macos")]
    async fn platform_clear(&self) -> AuthResult<()> {
        let _ = run_checked(
            "security",
            &["delete-generic-password", "-a", ACCOUNT, "-s", &self.service],
        )
        .await;
        Ok(())
    }

    #[cfg(target_os = "windows")]
    async fn platform_store(&self, payload: &str) -> AuthResult<()> {
        // cmdkey provides write/delete; reads go through PasswordVault.
        run_checked(
            "cmdkey",
            &[
                &format!("/generic:{}", self.service),
                &format!("/user:{ACCOUNT}"),
                &format!("/pass:{payload}"),
            ],
        )
        .await?;
        let script = r"
            [void][Windows.Security.Credentials.PasswordVault,Windows.Security.Credentials,ContentType=WindowsRuntime]
            $vault = New-Object Windows.Security.Credentials.PasswordVault
            $vault.Add((New-Object Windows.Security.Credentials.PasswordCredential($args[0], $args[1], $args[2])))
        ";
        run_checked(
            "powershell",
            &["-NoProfile", "-Command", script, &self.service, ACCOUNT, payload],
        )
        .await
        .map(|_| ())
    }

    #[cfg(target_os = "windows")]
    async fn platform_retrieve(&self) -> AuthResult<Option<String>> {
        let script = r"
            [void][Windows.Security.Credentials.PasswordVault,Windows.Security.Credentials,ContentType=WindowsRuntime]
            $vault = New-Object Windows.Security.Credentials.PasswordVault
            $cred = $vault.Retrieve($args[0], $args[1])
            $cred.RetrievePassword()
            Write-Output $cred.Password
        ";
        match run_checked(
            "powershell",
            &["-NoProfile", "-Command", script, &self.service, ACCOUNT],
        )
        .await
        {
            Ok(output) => Ok(Some(output.trim_end().to_string())),
            Err(_) => Ok(None),
        }
    }

    #[cfg(target_os = "windows")]
    async fn platform_clear(&self) -> AuthResult<()> {
        let _ = run_checked("cmdkey", &[&format!("/delete:{}", self.service)]).await;
        Ok(())
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    async fn platform_store(&self, payload: &str) -> AuthResult<()> {
        self.file_store(payload).await
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    async fn platform_retrieve(&self) -> AuthResult<Option<String>> {
        self.file_retrieve().await
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    async fn platform_clear(&self) -> AuthResult<()> {
        self.file_clear().await
    }
}

/// Run an external command with an argument array, failing on nonzero exit.
#[allow(dead_code)] // unused on platforms served by the file fallback
async fn run_checked(program: &str, args: &[&str]) -> AuthResult<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| AuthError::Storage(format!("{program} failed to start: {e}")))?;
    if !output.status.success() {
        return Err(AuthError::Storage(format!(
            "{program} exited with {}",
            output.status
        )));
    }
    String::from_utf8(output.stdout).map_err(|e| AuthError::Storage(e.to_string()))
}

#[async_trait]
impl TokenStore for KeychainTokenStore {
    async fn store(&self, token: TokenData) -> AuthResult<()> {
        let clean = token.sanitized()?;
        let payload =
            serde_json::to_string(&clean).map_err(|e| AuthError::Storage(e.to_string()))?;
        self.platform_store(&payload).await?;
        debug!(server = %self.server_id, "token stored in keychain");
        Ok(())
    }

    async fn retrieve(&self) -> AuthResult<Option<TokenData>> {
        let Some(payload) = self.platform_retrieve().await? else {
            return Ok(None);
        };
        match serde_json::from_str::<TokenData>(&payload) {
            Ok(token) => Ok(Some(token)),
            // An unreadable entry behaves like an expired token rather than
            // poisoning every retrieval.
            Err(e) => {
                debug!(server = %self.server_id, "stored token unreadable: {e}");
                Ok(None)
            }
        }
    }

    async fn clear(&self) -> AuthResult<()> {
        self.platform_clear().await
    }

    async fn is_expired(&self, buffer: ChronoDuration) -> bool {
        match self.retrieve().await {
            Ok(Some(token)) => token.is_expired(buffer),
            _ => true,
        }
    }
}
