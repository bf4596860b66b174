//! Display-only lookups: the caller's public IP and country flag images.

use std::sync::OnceLock;
use std::time::Duration;

use serde::Deserialize;

const IPIFY_URL: &str = "https://api.ipify.org?format=json";
const FLAG_CDN: &str = "https://flagcdn.com";
const FALLBACK_FLAG: &str = "us";

/// Shared HTTP client with a 5s timeout for lookups. `None` if it could not
/// be built.
fn lookup_http_client() -> Option<&'static reqwest::Client> {
    static CLIENT: OnceLock<Option<reqwest::Client>> = OnceLock::new();
    CLIENT
        .get_or_init(|| {
            reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .map_err(|e| log::warn!("Failed to build lookup HTTP client: {}", e))
                .ok()
        })
        .as_ref()
}

#[derive(Debug, Deserialize)]
struct IpifyResponse {
    ip: String,
}

/// The caller's public IP as seen from the internet, `None` on any failure.
pub async fn lookup_public_ip() -> Option<String> {
    let client = lookup_http_client()?;

    let response = match client.get(IPIFY_URL).send().await {
        Ok(r) => r,
        Err(e) => {
            log::warn!("Public IP lookup failed: {}", e);
            return None;
        }
    };

    match response.json::<IpifyResponse>().await {
        Ok(body) if !body.ip.is_empty() => Some(body.ip),
        Ok(_) => None,
        Err(e) => {
            log::warn!("Failed to parse public IP response: {}", e);
            None
        }
    }
}

fn country_code_for_name(name: &str) -> Option<&'static str> {
    let code = match name.trim().to_lowercase().as_str() {
        "united states" | "usa" => "us",
        "united kingdom" | "uk" => "gb",
        "germany" => "de",
        "france" => "fr",
        "netherlands" => "nl",
        "spain" => "es",
        "italy" => "it",
        "canada" => "ca",
        "australia" => "au",
        "japan" => "jp",
        "singapore" => "sg",
        "india" => "in",
        "brazil" => "br",
        "mexico" => "mx",
        "sweden" => "se",
        "norway" => "no",
        "denmark" => "dk",
        "finland" => "fi",
        "poland" => "pl",
        "switzerland" => "ch",
        "austria" => "at",
        "belgium" => "be",
        "czech republic" => "cz",
        "ireland" => "ie",
        "portugal" => "pt",
        "greece" => "gr",
        "hong kong" => "hk",
        "south korea" => "kr",
        "taiwan" => "tw",
        "israel" => "il",
        "south africa" => "za",
        "new zealand" => "nz",
        "argentina" => "ar",
        "chile" => "cl",
        "colombia" => "co",
        "turkey" => "tr",
        "russia" => "ru",
        "ukraine" => "ua",
        "romania" => "ro",
        "bulgaria" => "bg",
        "hungary" => "hu",
        _ => return None,
    };
    Some(code)
}

/// Flag image URL at `width` pixels (flagcdn sizes such as 40 or 640).
///
/// A two-letter code wins; otherwise the country name is mapped, falling back
/// to the US flag.
pub fn flag_url(country_code: &str, country_name: &str, width: u32) -> String {
    let code = country_code.trim();
    let code = if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        code.to_ascii_lowercase()
    } else {
        country_code_for_name(country_name)
            .unwrap_or(FALLBACK_FLAG)
            .to_string()
    };
    format!("{}/w{}/{}.png", FLAG_CDN, width, code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_lowercased() {
        assert_eq!(flag_url("DE", "Germany", 40), "https://flagcdn.com/w40/de.png");
        assert_eq!(flag_url("nl", "", 640), "https://flagcdn.com/w640/nl.png");
    }

    #[test]
    fn name_is_mapped_when_code_missing() {
        assert_eq!(flag_url("", " United Kingdom ", 40), "https://flagcdn.com/w40/gb.png");
        assert_eq!(flag_url("DEU", "germany", 40), "https://flagcdn.com/w40/de.png");
    }

    #[test]
    fn unknown_country_falls_back() {
        assert_eq!(flag_url("", "Atlantis", 40), "https://flagcdn.com/w40/us.png");
    }
}
