use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use {
    bambooclaw_common::{AuthContext, TokenScope},
    bambooclaw_config::{GatewayConfig, SecurityConfig},
    tracing::{info, warn},
};

use crate::{
    error::{AuthError, PairingError, Result, SecurityError},
    network::{NetworkDecision, NetworkPolicy},
    pairing::PairingGuard,
    path::{PathPolicy, ScopedPath, scope_path},
    token::{PairingToken, TokenStore},
};

/// The single security boundary: tokens, pairing, path scoping, and network
/// policy. Every check is deny-by-default.
pub struct SecurityGate {
    tokens: TokenStore,
    pairing: PairingGuard,
    paths: PathPolicy,
    network: NetworkPolicy,
    workspace: Option<PathBuf>,
}

impl SecurityGate {
    #[must_use]
    pub fn new(
        tokens: TokenStore,
        pairing: PairingGuard,
        paths: PathPolicy,
        network: NetworkPolicy,
    ) -> Self {
        Self {
            tokens,
            pairing,
            paths,
            network,
            workspace: None,
        }
    }

    /// Build from config. Token digests persist under `data_dir` when
    /// `security.persist_tokens` is set.
    #[must_use]
    pub fn from_config(security: &SecurityConfig, gateway: &GatewayConfig, data_dir: &Path) -> Self {
        let ttl = security.token_ttl_secs.map(Duration::from_secs);
        let tokens = if security.persist_tokens {
            TokenStore::persistent(ttl, data_dir.join("tokens.json"))
        } else {
            TokenStore::new(ttl)
        };
        Self::new(
            tokens,
            PairingGuard::new(gateway.pairing_code.clone()),
            PathPolicy::from_config(security),
            NetworkPolicy::new(&security.egress_allowlist, gateway.allow_public_bind),
        )
    }

    #[must_use]
    pub fn with_workspace(mut self, workspace: PathBuf) -> Self {
        self.workspace = Some(workspace);
        self
    }

    #[must_use]
    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    pub fn issue_token(&self, scope: TokenScope) -> std::result::Result<PairingToken, PairingError> {
        self.tokens.issue(scope)
    }

    pub fn verify(
        &self,
        token: Option<&str>,
        required: TokenScope,
    ) -> std::result::Result<AuthContext, AuthError> {
        self.tokens.verify(token, required)
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.revoke(token)
    }

    pub fn revoke_all(&self) -> usize {
        self.tokens.revoke_all()
    }

    pub fn purge_expired(&self) -> usize {
        self.tokens.purge_expired()
    }

    #[must_use]
    pub fn active_tokens(&self) -> usize {
        self.tokens.active_count()
    }

    /// Exchange the setup code for a token.
    pub fn pair(
        &self,
        setup_code: &str,
        scope: TokenScope,
    ) -> std::result::Result<PairingToken, PairingError> {
        if let Err(e) = self.pairing.check(setup_code) {
            warn!(reason = %e, "pairing rejected");
            return Err(e);
        }
        let token = self.tokens.issue(scope)?;
        info!(token_id = %token.token_id(), %scope, "pairing succeeded");
        Ok(token)
    }

    #[must_use]
    pub fn pairing_configured(&self) -> bool {
        self.pairing.is_configured()
    }

    pub fn scope_path(&self, base: &Path, requested: &Path) -> Result<ScopedPath> {
        scope_path(base, requested, &self.paths).inspect_err(|e| {
            warn!(base = %base.display(), error = %e, "path access denied");
        })
    }

    /// Scope `requested` to the configured workspace.
    pub fn scope_workspace_path(&self, requested: &Path) -> Result<ScopedPath> {
        let Some(workspace) = &self.workspace else {
            return Err(SecurityError::denied(requested, "no workspace configured"));
        };
        self.scope_path(workspace, requested)
    }

    #[must_use]
    pub fn check_network_dest(&self, host: &str) -> NetworkDecision {
        let decision = self.network.check_egress(host);
        if decision == NetworkDecision::Denied {
            warn!(host = %host, "egress denied");
        }
        decision
    }

    /// Like [`Self::check_network_dest`] for a full URL, as an error.
    pub fn require_egress(&self, url: &str) -> Result<()> {
        match self.network.check_url(url) {
            NetworkDecision::Allowed => Ok(()),
            NetworkDecision::Denied => {
                let host = url::Url::parse(url)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string))
                    .unwrap_or_else(|| url.to_string());
                warn!(host = %host, "egress denied");
                Err(SecurityError::EgressDenied { host })
            },
        }
    }

    pub fn check_bind(&self, host: &str) -> Result<()> {
        self.network.check_bind(host)
    }
}
