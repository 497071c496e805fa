// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use vmadm_api_types::Brand;

/// Fields that are only meaningful for some brands.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum BrandField {
    AllowUnfilteredPromisc,
    Model,
    Vcpus,
    DiskDriver,
    NicDriver,
}

impl BrandField {
    /// Returns whether `brand` accepts this field.
    pub fn allowed_for(self, brand: Brand) -> bool {
        match self {
            BrandField::AllowUnfilteredPromisc
            | BrandField::Model
            | BrandField::Vcpus
            | BrandField::DiskDriver
            | BrandField::NicDriver => brand.is_hvm(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn hvm_only_fields() {
        for field in BrandField::iter() {
            assert!(field.allowed_for(Brand::Kvm), "{field}");
            assert!(!field.allowed_for(Brand::Joyent), "{field}");
            assert!(!field.allowed_for(Brand::JoyentMinimal), "{field}");
        }
    }

    #[test]
    fn names_match_record_keys() {
        assert_eq!(
            BrandField::from_str("allow_unfiltered_promisc").unwrap(),
            BrandField::AllowUnfilteredPromisc
        );
        assert_eq!(BrandField::NicDriver.to_string(), "nic_driver");
    }
}
