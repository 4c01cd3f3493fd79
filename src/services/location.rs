//! Building/floor resolution from hierarchical topic segments
//!
//! Topic segments are free text typed into gateway firmware, so matching is
//! forgiving: exact code, then slug equality on name or code. A miss is
//! never an error; the gateway is simply registered without a location.

use std::sync::Arc;

use crate::domain::types::{Building, BuildingId, Floor, FloorId};
use crate::store::{Store, StoreResult};

/// Result of resolving topic location segments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolvedLocation {
    pub building_id: Option<BuildingId>,
    pub floor_id: Option<FloorId>,
}

/// Lowercase ASCII slug: accents folded, non-alphanumeric runs become `-`
pub fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_dash = false;
    for c in text.chars().flat_map(fold_char) {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

/// ASCII fold for the Latin-1 and Latin Extended-A letters seen in site names
fn fold_char(c: char) -> impl Iterator<Item = char> {
    let folded: &'static str = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' | 'Ă' | 'Ą' => "A",
        'æ' => "ae",
        'Æ' => "AE",
        'ç' | 'ć' | 'č' => "c",
        'Ç' | 'Ć' | 'Č' => "C",
        'ď' | 'đ' => "d",
        'Ď' | 'Đ' => "D",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => "e",
        'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ė' | 'Ę' | 'Ě' => "E",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' => "i",
        'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' | 'Į' => "I",
        'ł' => "l",
        'Ł' => "L",
        'ñ' | 'ń' | 'ň' => "n",
        'Ñ' | 'Ń' | 'Ň' => "N",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' | 'Ő' => "O",
        'œ' => "oe",
        'Œ' => "OE",
        'ř' => "r",
        'Ř' => "R",
        'ś' | 'š' | 'ş' => "s",
        'Ś' | 'Š' | 'Ş' => "S",
        'ß' => "ss",
        'ť' | 'ţ' => "t",
        'Ť' | 'Ţ' => "T",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' | 'ų' => "u",
        'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' | 'Ů' | 'Ű' | 'Ų' => "U",
        'ý' | 'ÿ' => "y",
        'Ý' | 'Ÿ' => "Y",
        'ź' | 'ż' | 'ž' => "z",
        'Ź' | 'Ż' | 'Ž' => "Z",
        _ => "",
    };
    let passthrough = if folded.is_empty() { Some(c) } else { None };
    folded.chars().chain(passthrough)
}

/// Exact case-insensitive code, else slug equality against name or code
pub fn match_building<'a>(buildings: &'a [Building], segment: &str) -> Option<&'a Building> {
    let segment = segment.trim();
    if segment.is_empty() {
        return None;
    }
    if let Some(b) = buildings
        .iter()
        .find(|b| b.code.as_deref().is_some_and(|code| code.trim().eq_ignore_ascii_case(segment)))
    {
        return Some(b);
    }

    let wanted = slugify(segment);
    if wanted.is_empty() {
        return None;
    }
    buildings.iter().find(|b| {
        slugify(&b.name) == wanted || b.code.as_deref().is_some_and(|code| slugify(code) == wanted)
    })
}

/// Numeric segment matches the stored level first; otherwise (or on a
/// level miss) slug equality on the floor name
pub fn match_floor<'a>(floors: &'a [Floor], segment: &str) -> Option<&'a Floor> {
    let segment = segment.trim();
    if segment.is_empty() {
        return None;
    }
    if let Ok(level) = segment.parse::<i32>() {
        if let Some(f) = floors.iter().find(|f| f.level == Some(level)) {
            return Some(f);
        }
    }

    let wanted = slugify(segment);
    if wanted.is_empty() {
        return None;
    }
    floors.iter().find(|f| slugify(&f.name) == wanted)
}

/// Resolves topic segments against the location catalog
pub struct LocationResolver {
    store: Arc<dyn Store>,
}

impl LocationResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        building: Option<&str>,
        floor: Option<&str>,
    ) -> StoreResult<ResolvedLocation> {
        let Some(building_segment) = building else {
            return Ok(ResolvedLocation::default());
        };

        let buildings = self.store.list_buildings().await?;
        let Some(building) = match_building(&buildings, building_segment) else {
            return Ok(ResolvedLocation::default());
        };

        let floor_id = match floor {
            Some(segment) => {
                let floors = self.store.list_floors(building.id).await?;
                match_floor(&floors, segment).map(|f| f.id)
            }
            None => None,
        };

        Ok(ResolvedLocation { building_id: Some(building.id), floor_id })
    }
}
