/// Append a bearer token to a connect URL as the `token` query parameter.
///
/// Rebuilt from the base URL at every dial so a token replaced between
/// attempts is picked up by the next one. Tokens are passed through verbatim
/// and are expected to be URL-safe (bearer tokens and JWTs are).
pub fn compose_token_url(base: &str, token: Option<&str>) -> String {
    match token {
        None => base.to_string(),
        Some(token) => {
            let sep = if base.contains('?') { '&' } else { '?' };
            format!("{}{}token={}", base, sep, token)
        }
    }
}
