use serde::Serialize;

const PRODUCT_NAME: &str = "Market Pulse";
const IDENTIFIER: &str = "dev.market-pulse.core";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfoResponse {
    pub product_name: String,
    pub package: String,
    pub version: String,
    pub identifier: String,
    pub platform: String,
    pub arch: String,
}

pub fn build_app_info_response(
    product_name: String,
    version: String,
    identifier: String,
) -> AppInfoResponse {
    AppInfoResponse {
        product_name,
        package: env!("CARGO_PKG_NAME").to_string(),
        version,
        identifier,
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
    }
}

pub fn app_info() -> AppInfoResponse {
    build_app_info_response(
        PRODUCT_NAME.to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
        IDENTIFIER.to_string(),
    )
}
