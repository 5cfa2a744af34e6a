/// Payment gateway credentials.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Secret key used to verify webhook signatures.
    secret: Box<[u8]>,
}

impl GatewayConfig {
    pub fn new(secret: impl Into<Box<[u8]>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("secret", &"<redacted>")
            .finish()
    }
}
