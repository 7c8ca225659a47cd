//! Authorization URL construction.

use crate::credentials::ClientSecret;

/// Parameters of one authorization request.
#[derive(Clone, Debug)]
pub struct AuthorizationRequest<'a> {
    pub client: &'a ClientSecret,
    pub redirect_uri: &'a str,
    pub scopes: &'a [String],
    pub state: &'a str,
}

impl AuthorizationRequest<'_> {
    /// Build the consent URL the user opens in a browser.
    ///
    /// Requests offline access with forced consent so the provider always issues a refresh token.
    pub fn build_url(&self) -> String {
        let scopes = self.scopes.join(" ");
        let separator = if self.client.auth_uri.contains('?') { '&' } else { '?' };
        format!(
            "{}{}client_id={}&redirect_uri={}&response_type=code&scope={}&state={}&access_type=offline&prompt=consent",
            self.client.auth_uri,
            separator,
            urlencoding::encode(&self.client.client_id),
            urlencoding::encode(self.redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(self.state)
        )
    }
}
