//! Core domain model for admap: raw ads, listing summaries, and the canonical
//! geo-referenced listing record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "admap-core";

/// Sort order requested from the ad source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    DateDesc,
    DateAsc,
    PriceAsc,
    PriceDesc,
}

impl SortOrder {
    pub fn as_query_value(&self) -> &'static str {
        match self {
            SortOrder::DateDesc => "dateDesc",
            SortOrder::DateAsc => "dateAsc",
            SortOrder::PriceAsc => "priceAsc",
            SortOrder::PriceDesc => "priceDesc",
        }
    }
}

fn default_sort() -> SortOrder {
    SortOrder::DateDesc
}

fn default_min_results() -> usize {
    20
}

/// Search parameters for one sync target's listing query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub location: String,
    pub category: String,
    #[serde(default = "default_sort")]
    pub sort: SortOrder,
    #[serde(default = "default_min_results")]
    pub min_results: usize,
}

/// Minimal candidate descriptor lifted from a listing index page: enough to
/// decide whether a full detail fetch is warranted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSummary {
    pub id: String,
    pub link: String,
}

/// Nested location object inside a raw ad's attribute bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AdLocation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(rename = "mapAddress", skip_serializing_if = "Option::is_none")]
    pub map_address: Option<String>,
}

/// Well-known raw attributes, with everything else the source sent retained
/// verbatim through the flattened remainder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AdAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(rename = "numberbedrooms", skip_serializing_if = "Option::is_none")]
    pub bedrooms: Option<f64>,
    #[serde(rename = "numberbathrooms", skip_serializing_if = "Option::is_none")]
    pub bathrooms: Option<f64>,
    #[serde(rename = "areainfeet", skip_serializing_if = "Option::is_none")]
    pub sqft: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<AdLocation>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Raw ad record as returned by the ad source. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAd {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub attributes: AdAttributes,
}

/// Persisted document layout for a sync target. The three historical pipeline
/// variants differed only in collection names and this shape, so it is a
/// parameter rather than a copy of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentShape {
    GeoFeature,
    Flat,
}

impl DocumentShape {
    /// Dotted path of the identity key inside a persisted document.
    pub fn id_path(&self) -> &'static str {
        match self {
            DocumentShape::GeoFeature => "properties.listingId",
            DocumentShape::Flat => "listingId",
        }
    }
}

/// A raw ad missing the fields a canonical record requires. Skippable per
/// record; never aborts a batch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedAd {
    #[error("ad has no listing identifier")]
    MissingListingId,
    #[error("ad {listing_id} has no usable coordinates")]
    MissingCoordinates { listing_id: String },
}

/// Normalized listing record. `listing_id` is the sole deduplication key; the
/// permanent collection never holds two documents sharing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalListing {
    pub listing_id: String,
    pub title: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub price: Option<f64>,
    pub bedrooms: Option<f64>,
    pub bathrooms: Option<f64>,
    pub sqft: Option<f64>,
    pub url: Option<String>,
    pub image: Option<String>,
    pub images: Vec<String>,
    pub address: Option<String>,
    /// `[longitude, latitude]`, GeoJSON point order.
    pub coordinates: [f64; 2],
    /// Original attribute bag, kept for forward compatibility.
    pub attributes: JsonValue,
}

impl CanonicalListing {
    /// Normalize a raw ad. Requires a non-empty identifier and numeric
    /// coordinates; price, room counts, and area pass through as supplied and
    /// absent values stay absent.
    pub fn from_raw(ad: &RawAd) -> Result<Self, MalformedAd> {
        if ad.id.trim().is_empty() {
            return Err(MalformedAd::MissingListingId);
        }
        let location = ad.attributes.location.as_ref();
        let coordinates = match location.and_then(|l| Some([l.longitude?, l.latitude?])) {
            Some(pair) => pair,
            None => {
                return Err(MalformedAd::MissingCoordinates {
                    listing_id: ad.id.clone(),
                })
            }
        };

        Ok(Self {
            listing_id: ad.id.clone(),
            title: ad.title.clone(),
            date: ad.date,
            price: ad.attributes.price,
            bedrooms: ad.attributes.bedrooms,
            bathrooms: ad.attributes.bathrooms,
            sqft: ad.attributes.sqft,
            url: ad.url.clone(),
            image: ad.image.clone(),
            images: ad.images.clone(),
            address: location.and_then(|l| l.map_address.clone()),
            coordinates,
            attributes: serde_json::to_value(&ad.attributes).unwrap_or(JsonValue::Null),
        })
    }

    /// Render the document persisted for the given shape. Optional fields that
    /// are absent are omitted entirely rather than written as null or zero.
    pub fn to_document(&self, shape: DocumentShape) -> JsonValue {
        let mut fields = Map::new();
        fields.insert("listingId".to_string(), json!(self.listing_id));
        insert_present(&mut fields, "title", &self.title);
        insert_present(&mut fields, "date", &self.date);
        insert_present(&mut fields, "price", &self.price);
        insert_present(&mut fields, "bedrooms", &self.bedrooms);
        insert_present(&mut fields, "bathrooms", &self.bathrooms);
        insert_present(&mut fields, "sqft", &self.sqft);
        insert_present(&mut fields, "url", &self.url);
        insert_present(&mut fields, "image", &self.image);
        fields.insert("images".to_string(), json!(self.images));
        insert_present(&mut fields, "address", &self.address);
        fields.insert("attributes".to_string(), self.attributes.clone());

        match shape {
            DocumentShape::GeoFeature => json!({
                "type": "Feature",
                "geometry": {
                    "type": "Point",
                    "coordinates": self.coordinates,
                },
                "properties": JsonValue::Object(fields),
            }),
            DocumentShape::Flat => {
                fields.insert(
                    "location".to_string(),
                    json!({
                        "type": "Point",
                        "coordinates": self.coordinates,
                    }),
                );
                JsonValue::Object(fields)
            }
        }
    }
}

fn insert_present<T: Serialize>(fields: &mut Map<String, JsonValue>, key: &str, value: &Option<T>) {
    if let Some(value) = value {
        if let Ok(rendered) = serde_json::to_value(value) {
            fields.insert(key.to_string(), rendered);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn mk_raw(id: &str, lat: Option<f64>, lng: Option<f64>) -> RawAd {
        RawAd {
            id: id.to_string(),
            title: Some("Sunny 2BR near High Park".to_string()),
            date: Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single(),
            image: Some("https://img.example/1.jpg".to_string()),
            images: vec![
                "https://img.example/1.jpg".to_string(),
                "https://img.example/2.jpg".to_string(),
            ],
            url: Some("https://ads.example/v-apartments/1719283746".to_string()),
            attributes: AdAttributes {
                price: Some(2450.0),
                bedrooms: Some(2.0),
                bathrooms: Some(1.5),
                sqft: Some(840.0),
                location: Some(AdLocation {
                    latitude: lat,
                    longitude: lng,
                    map_address: Some("123 Roncesvalles Ave, Toronto".to_string()),
                }),
                extra: Map::new(),
            },
        }
    }

    #[test]
    fn normalization_keeps_geojson_coordinate_order() {
        let listing = CanonicalListing::from_raw(&mk_raw("1719283746", Some(43.64), Some(-79.45)))
            .expect("normalizes");
        assert_eq!(listing.coordinates, [-79.45, 43.64]);

        let doc = listing.to_document(DocumentShape::GeoFeature);
        assert_eq!(doc["geometry"]["coordinates"][0], json!(-79.45));
        assert_eq!(doc["geometry"]["coordinates"][1], json!(43.64));
    }

    #[test]
    fn missing_coordinates_is_a_per_record_error() {
        let err = CanonicalListing::from_raw(&mk_raw("1719283746", None, Some(-79.45)))
            .expect_err("latitude missing");
        assert_eq!(
            err,
            MalformedAd::MissingCoordinates {
                listing_id: "1719283746".to_string()
            }
        );

        let mut no_location = mk_raw("1719283746", Some(43.64), Some(-79.45));
        no_location.attributes.location = None;
        assert!(CanonicalListing::from_raw(&no_location).is_err());
    }

    #[test]
    fn blank_identifier_is_rejected() {
        let err = CanonicalListing::from_raw(&mk_raw("  ", Some(43.64), Some(-79.45)))
            .expect_err("blank id");
        assert_eq!(err, MalformedAd::MissingListingId);
    }

    #[test]
    fn absent_optionals_are_omitted_not_zeroed() {
        let mut raw = mk_raw("88", Some(43.64), Some(-79.45));
        raw.attributes.price = None;
        raw.attributes.bedrooms = None;
        let listing = CanonicalListing::from_raw(&raw).expect("normalizes");
        assert_eq!(listing.price, None);

        let doc = listing.to_document(DocumentShape::Flat);
        let obj = doc.as_object().expect("flat doc is an object");
        assert!(!obj.contains_key("price"));
        assert!(!obj.contains_key("bedrooms"));
        assert_eq!(obj["bathrooms"], json!(1.5));
    }

    #[test]
    fn geo_feature_nests_listing_fields_under_properties() {
        let listing = CanonicalListing::from_raw(&mk_raw("42", Some(43.64), Some(-79.45)))
            .expect("normalizes");
        let doc = listing.to_document(DocumentShape::GeoFeature);
        assert_eq!(doc["type"], json!("Feature"));
        assert_eq!(doc["properties"]["listingId"], json!("42"));
        assert_eq!(
            doc["properties"]["address"],
            json!("123 Roncesvalles Ave, Toronto")
        );
        assert_eq!(DocumentShape::GeoFeature.id_path(), "properties.listingId");
    }

    #[test]
    fn flat_shape_keeps_identity_at_top_level() {
        let listing = CanonicalListing::from_raw(&mk_raw("42", Some(43.64), Some(-79.45)))
            .expect("normalizes");
        let doc = listing.to_document(DocumentShape::Flat);
        assert_eq!(doc["listingId"], json!("42"));
        assert_eq!(doc["location"]["type"], json!("Point"));
        assert_eq!(DocumentShape::Flat.id_path(), "listingId");
    }

    #[test]
    fn attribute_bag_survives_normalization_verbatim() {
        let mut raw = mk_raw("7", Some(43.64), Some(-79.45));
        raw.attributes
            .extra
            .insert("petsallowed".to_string(), json!("limited"));
        let listing = CanonicalListing::from_raw(&raw).expect("normalizes");
        assert_eq!(listing.attributes["petsallowed"], json!("limited"));
        assert_eq!(listing.attributes["numberbedrooms"], json!(2.0));
    }
}
