
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::index::{Record, Scalar};

/// A housing project as served by the data service.
///
/// Field names follow the dataset's Spanish column names, with the English
/// names accepted as aliases. Unknown fields (units, coordinates, images) are
/// ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectDocument {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, rename = "nombre_proyecto", alias = "project_name")]
    pub name: Option<String>,
    #[serde(default, rename = "constructor", alias = "builder")]
    pub builder: Option<String>,
    #[serde(default, rename = "estado", alias = "status")]
    pub status: Option<String>,
    #[serde(default, rename = "ciudad", alias = "city")]
    pub city: Option<String>,
    #[serde(default, rename = "zona", alias = "zone")]
    pub zone: Option<String>,
    #[serde(
        default,
        rename = "descripcion_general",
        alias = "general_description"
    )]
    pub general_description: Option<String>,
    #[serde(default, rename = "amenidades", alias = "amenities")]
    pub amenities: Option<Amenities>,
    #[serde(default, rename = "tipo", alias = "type_property")]
    pub property_type: Option<String>,
    #[serde(
        default,
        rename = "area_minima_m2_desde",
        alias = "area_min_square"
    )]
    pub area_min_m2: Option<f64>,
    #[serde(default, rename = "banios_minimo_desde", alias = "bathroom_min")]
    pub bathrooms_min: Option<f64>,
    #[serde(
        default,
        rename = "habitaciones_minimo_desde",
        alias = "bedrooms_min"
    )]
    pub bedrooms_min: Option<f64>,
    #[serde(default, rename = "precio_minimo_desde", alias = "price_min")]
    pub price_min: Option<f64>,
    #[serde(default, rename = "precio_maximo_hasta", alias = "price_max")]
    pub price_max: Option<f64>,
    #[serde(
        default,
        rename = "tipo_uso_recomendado",
        alias = "recommended_use"
    )]
    pub recommended_use: Option<String>,
    #[serde(default, rename = "estrato", alias = "socioeconomic_level")]
    pub socioeconomic_level: Option<f64>,
    #[serde(default, rename = "renta_corta", alias = "short_term_rental")]
    pub short_term_rental: Option<bool>,
}

/// Amenities arrive either as a list or as one pre-joined string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Amenities {
    List(Vec<String>),
    Text(String),
}

impl Amenities {
    fn joined(&self) -> String {
        match self {
            Self::List(items) => items
                .iter()
                .map(|item| item.trim())
                .filter(|item| !item.is_empty())
                .collect::<Vec<_>>()
                .join(", "),
            Self::Text(text) => text.trim().to_string(),
        }
    }
}

impl ProjectDocument {
    /// The text that gets embedded for this project.
    ///
    /// Non-empty parts joined by ". ": description, city, zone, property
    /// type, price range, minimum bedrooms / bathrooms / area, recommended
    /// use and the amenity list.
    #[inline]
    pub fn compose_text(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        for text in [
            &self.general_description,
            &self.city,
            &self.zone,
            &self.property_type,
        ]
        .into_iter()
        .flatten()
        {
            parts.push(text.trim().to_string());
        }

        if let Some(price) = positive(self.price_min) {
            parts.push(format!("Prices from ${}", format_number(price)));
        }
        if let Some(price) = positive(self.price_max) {
            parts.push(format!("up to ${}", format_number(price)));
        }
        if let Some(bedrooms) = positive(self.bedrooms_min) {
            parts.push(format!("{} bedrooms", bedrooms.trunc()));
        }
        if let Some(bathrooms) = positive(self.bathrooms_min) {
            parts.push(format!("{} bathrooms", bathrooms.trunc()));
        }
        if let Some(area) = positive(self.area_min_m2) {
            parts.push(format!("{} m2", area.trunc()));
        }
        if let Some(usage) = self.recommended_use.as_deref().filter(|u| !u.trim().is_empty()) {
            parts.push(format!("Use: {}", usage.trim()));
        }
        if let Some(amenities) = &self.amenities {
            let joined = amenities.joined();
            if !joined.is_empty() {
                parts.push(format!("Amenities: {}", joined));
            }
        }

        parts.retain(|part| !part.is_empty());
        parts.join(". ")
    }

    /// Convert into an indexable record; `None` when there is nothing to embed
    #[inline]
    pub fn into_record(self) -> Option<Record> {
        let text = self.compose_text();
        if text.is_empty() {
            warn!("Skipping project {} with empty description", self.id);
            return None;
        }

        let mut record = Record::new(self.id, text);
        let strings = [
            ("name", self.name),
            ("builder", self.builder),
            ("status", self.status),
            ("city", self.city),
            ("zone", self.zone),
            ("property_type", self.property_type),
            ("recommended_use", self.recommended_use),
        ];
        for (key, value) in strings {
            if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
                record.metadata.insert(key.to_string(), Scalar::Text(value));
            }
        }
        let numbers = [
            ("price_min", self.price_min),
            ("price_max", self.price_max),
            ("bedrooms_min", self.bedrooms_min),
        ];
        for (key, value) in numbers {
            if let Some(value) = value.filter(|v| v.is_finite()) {
                record.metadata.insert(key.to_string(), Scalar::Number(value));
            }
        }

        Some(record)
    }
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

/// Whole numbers print without a fractional part
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(text) => text,
        Id::Number(number) => number.to_string(),
    })
}
