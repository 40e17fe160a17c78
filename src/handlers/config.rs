use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Serializable view of the configuration with the credential masked.
fn config_view(config: &crate::config::AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "upstream": {
            "url": config.upstream.url,
            "model": config.upstream.model,
            // Never echo the credential itself
            "credential_configured": config.credential_configured()
        },
        "session": {
            "instructions": config.session.instructions,
            "voice": config.session.voice,
            "transcription_model": config.session.transcription_model,
            "temperature": config.session.temperature,
            "max_response_output_tokens": config.session.max_response_output_tokens,
            "turn_detection": {
                "threshold": config.session.turn_detection.threshold,
                "prefix_padding_ms": config.session.turn_detection.prefix_padding_ms,
                "silence_duration_ms": config.session.turn_detection.silence_duration_ms
            }
        },
        "audio": {
            "sample_rate": config.audio.sample_rate,
            "channels": config.audio.channels,
            "bit_depth": config.audio.bit_depth
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::BadRequest)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}
