use crate::domain::session::PairingQr;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use qrcode::render::svg;
use qrcode::QrCode;

const MIN_DIMENSION: u32 = 256;

/// Renders a pairing payload into something an `<img src>` accepts.
///
/// A gateway-rendered image wins; otherwise the raw code is encoded as an SVG data URL.
pub fn render_data_url(qr: &PairingQr) -> Result<String, String> {
    if let Some(image) = &qr.image {
        if image.starts_with("data:") {
            return Ok(image.clone());
        }
        return Ok(format!("data:image/png;base64,{image}"));
    }
    let code = qr
        .code
        .as_deref()
        .ok_or_else(|| "pairing payload is empty".to_string())?;
    let svg = QrCode::new(code.as_bytes())
        .map_err(|err| format!("QR generation failed: {err}"))?
        .render::<svg::Color>()
        .min_dimensions(MIN_DIMENSION, MIN_DIMENSION)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#FFFFFF"))
        .build();
    Ok(format!(
        "data:image/svg+xml;base64,{}",
        BASE64_STANDARD.encode(svg)
    ))
}
