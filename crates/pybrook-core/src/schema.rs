//! `SchemaDescriptor`: the facts an external HTTP layer needs to serve
//! `/pybrook-schema.json` (§6), without this crate depending on an HTTP framework.

use serde::Serialize;

use crate::ids::DEFAULT_SEPARATOR;
use crate::model::Engine;

#[derive(Debug, Clone, Serialize)]
pub struct FieldRef {
    pub stream_name: String,
    pub field_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamDescriptor {
    pub stream_name: String,
    pub websocket_path: String,
    pub report_schema: serde_json::Value,
}

/// Mirrors the `/pybrook-schema.json` document described in §6. `latitude_field`,
/// `longitude_field`, `time_field`, and `group_field` are looked up by convention from
/// field names the caller designates; `direction_field` is optional.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaDescriptor {
    pub streams: Vec<StreamDescriptor>,
    pub latitude_field: Option<FieldRef>,
    pub longitude_field: Option<FieldRef>,
    pub time_field: Option<FieldRef>,
    pub group_field: Option<FieldRef>,
    pub direction_field: Option<FieldRef>,
    pub msg_id_field: String,
    pub special_char: String,
}

impl SchemaDescriptor {
    /// Builds the descriptor for `engine`'s output reports, resolving the well-known
    /// geo/time/group/direction roles from field names supplied by the caller (the
    /// embedding application knows which of its fields plays which role; the engine
    /// itself assigns no special meaning to any field name).
    pub fn build(
        engine: &Engine,
        latitude_field: Option<&str>,
        longitude_field: Option<&str>,
        time_field: Option<&str>,
        group_field: Option<&str>,
        direction_field: Option<&str>,
    ) -> Self {
        let resolve = |name: Option<&str>| -> Option<FieldRef> {
            let name = name?;
            let stream_name = engine.stream_of(name)?;
            Some(FieldRef {
                stream_name,
                field_name: name.to_string(),
            })
        };

        let streams = engine
            .outputs
            .iter()
            .map(|o| StreamDescriptor {
                stream_name: o.output_stream().to_string(),
                websocket_path: format!("/ws/{}", o.output_stream()),
                report_schema: serde_json::json!({
                    "properties": o
                        .required_fields
                        .iter()
                        .map(|f| {
                            let ty = engine
                                .field(f)
                                .map(|d| d.json_type.clone())
                                .unwrap_or_else(|| "string".to_string());
                            (f.clone(), serde_json::json!({ "type": ty }))
                        })
                        .collect::<serde_json::Map<_, _>>(),
                }),
            })
            .collect();

        Self {
            streams,
            latitude_field: resolve(latitude_field),
            longitude_field: resolve(longitude_field),
            time_field: resolve(time_field),
            group_field: resolve(group_field),
            direction_field: resolve(direction_field),
            msg_id_field: "_msg".to_string(),
            special_char: DEFAULT_SEPARATOR.to_string(),
        }
    }
}
