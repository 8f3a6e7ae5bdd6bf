//! One-time password enrollment and challenge.

use std::io::Write;

use ::common::api::{LoginResponse, OtpInitializeRequest, OtpInitializeResponse, OtpRequest, OtpSeedType};
use reqwest::{Method, StatusCode};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::AuthError;
use crate::prompt::Prompter;
use crate::transport::{self, ApiClient, MediaType};

pub const MAX_OTP_ATTEMPTS: usize = 3;

/// Runs enrollment (when the server asks for it) and up to [`MAX_OTP_ATTEMPTS`] challenges.
///
/// `api` must carry the login token as its bearer. Returns the token issued for the accepted
/// code, which replaces the login token for the next authorization attempt.
pub async fn challenge(
    api: &ApiClient,
    password: Option<&str>,
    prompter: &dyn Prompter,
    interactive: bool,
) -> Result<LoginResponse, AuthError> {
    if !interactive {
        return Err(AuthError::OtpRequiresPrompt);
    }

    let seed: OtpInitializeResponse = api
        .post_json(
            "/authentication/otp/initialize",
            &OtpInitializeRequest {
                user_password: password.unwrap_or_default().to_string(),
            },
        )
        .await?;

    // Keeps the barcode page alive until the challenge is over.
    let _barcode = match seed.kind {
        OtpSeedType::Secret => present_seed(&seed)?,
        OtpSeedType::AlreadySeeded => None,
    };

    for attempt in 1..=MAX_OTP_ATTEMPTS {
        let otp = prompter.password("Please enter your one-time password:")?;
        match submit(api, otp.trim()).await? {
            Some(token) => {
                debug!(attempt, "one-time password accepted");
                return Ok(token);
            }
            None => {
                let remaining = MAX_OTP_ATTEMPTS - attempt;
                eprintln!("[error] Invalid one-time password, {remaining} attempts left");
            }
        }
    }
    Err(AuthError::InvalidOtp)
}

/// `Ok(None)` when the server rejected the code.
async fn submit(api: &ApiClient, otp: &str) -> Result<Option<LoginResponse>, AuthError> {
    let req = api
        .request(Method::POST, "/authentication/otp", MediaType::Json)
        .json(&OtpRequest { otp: otp.to_string() });
    let res = api.send_raw(req).await?;
    if res.status() == StatusCode::UNAUTHORIZED {
        return Ok(None);
    }
    let res = transport::check_status(res).await?;
    Ok(Some(transport::decode_json(res).await?))
}

fn present_seed(seed: &OtpInitializeResponse) -> Result<Option<NamedTempFile>, AuthError> {
    let secret = seed.secret.as_deref().unwrap_or_default();
    let page = match seed.barcode.as_deref() {
        Some(barcode) if !barcode.is_empty() => match barcode_page(barcode, secret) {
            Ok(page) => Some(page),
            Err(err) => {
                warn!(%err, "could not write the enrollment barcode");
                None
            }
        },
        _ => None,
    };
    if let Some(page) = page.as_ref() {
        eprintln!(
            "\nOpen {} to scan the barcode to your authenticator app",
            page.path().display()
        );
    }
    if secret.is_empty() {
        return Err(AuthError::Invariant(
            "one-time password enrollment returned no secret".into(),
        ));
    }
    eprintln!("\nIf you can't use the barcode, enter {secret} in your authenticator app\n");
    Ok(page)
}

fn barcode_page(barcode: &str, secret: &str) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("sdpctl-otp-")
        .suffix(".html")
        .tempfile()?;
    write!(
        file,
        "<!DOCTYPE html><html><head><title>sdpctl one-time password</title></head><body>\
<p>Scan the barcode with your authenticator app.</p>\
<img src=\"data:image/png;base64,{barcode}\" alt=\"barcode\"/>\
<p>Secret: <code>{secret}</code></p></body></html>"
    )?;
    file.flush()?;
    Ok(file)
}
