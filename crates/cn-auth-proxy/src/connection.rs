use uuid::Uuid;

/// Identity and authorization record for one proxied session.
///
/// Policies and listeners only ever see `&ConnectionInfo`; the authorization
/// transition goes through [`ConnectionInfo::authorize`], which the auth state
/// machine is the only caller of.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    connection_id: String,
    ip_addr: String,
    client_pubkey: Option<String>,
}

impl ConnectionInfo {
    pub fn new(ip_addr: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), ip_addr)
    }

    pub fn with_id(connection_id: impl Into<String>, ip_addr: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            ip_addr: ip_addr.into(),
            client_pubkey: None,
        }
    }

    /// Also serves as the NIP-42 challenge.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn ip_addr(&self) -> &str {
        &self.ip_addr
    }

    pub fn client_authorized(&self) -> bool {
        self.client_pubkey.is_some()
    }

    pub fn client_pubkey(&self) -> Option<&str> {
        self.client_pubkey.as_deref()
    }

    /// One-way transition. Returns false and keeps the first identity when
    /// the session is already authorized.
    pub(crate) fn authorize(&mut self, pubkey: &str) -> bool {
        if self.client_pubkey.is_some() {
            return false;
        }
        self.client_pubkey = Some(pubkey.to_string());
        true
    }
}
