// cms_importer/src/catalog.rs
// Built-in descriptors for the export files the importer knows about.

use crate::entity::EntitySpec;

pub fn locations() -> EntitySpec {
    EntitySpec::new("location", "locations", "LocationId", "location_id",).field("Title", "title",)
}

pub fn provinces() -> EntitySpec {
    EntitySpec::new("province", "provinces", "ProvinceId", "province_id",)
        .field("Title", "title",)
        .child("Locations", "locations", locations(),)
}

pub fn countries() -> EntitySpec {
    EntitySpec::new("country", "countries", "CountryId", "country_id",)
        .field("Title", "title",)
        .field("CountryCode", "code",)
        .child("Provinces", "provinces", provinces(),)
}

pub fn room_types() -> EntitySpec {
    EntitySpec::new("room type", "room-types", "RoomTypeId", "room_type_id",)
        .field("Title", "title",)
        .backfill_field("Description", "description",)
}

pub fn board_types() -> EntitySpec {
    EntitySpec::new("board type", "board-types", "BoardTypeId", "board_type_id",)
        .field("Title", "title",)
        .field("Code", "code",)
}

pub fn facilities() -> EntitySpec {
    EntitySpec::new("facility", "facilities", "FacilityId", "facility_id",)
        .field("Title", "title",)
        .field("Category", "category",)
}

pub fn images() -> EntitySpec {
    EntitySpec::new("image", "images", "ImageId", "image_id",)
        .field("Title", "title",)
        .field("Url", "url",)
        .field("SortOrder", "sort_order",)
}

/// Establishments reference locations imported by the countries job and own
/// their image and facility lists.
pub fn establishments() -> EntitySpec {
    EntitySpec::new("establishment", "establishments", "EstablishmentId", "establishment_id",)
        .field("Title", "title",)
        .field("Stars", "stars",)
        .backfill_field("Description", "description",)
        .backfill_field("ImageUrl", "image_url",)
        .reference("LocationId", "locations", "location_id", "location",)
        .child("Images", "images", images(),)
        .child("Facilities", "facilities", facilities(),)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn country_hierarchy_is_three_levels_deep() {
        assert_eq!(countries().collections(), vec![
            "countries".to_string(),
            "provinces".to_string(),
            "locations".to_string()
        ]);
    }

    #[test]
    fn establishments_reference_locations_without_owning_them() {
        let spec = establishments();
        assert_eq!(spec.references[0].collection, "locations");
        assert!(!spec.collections().contains(&"locations".to_string()));
    }
}
