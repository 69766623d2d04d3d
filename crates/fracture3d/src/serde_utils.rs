//! Serde adapters for glam types.
//!
//! Use with `#[serde(with = "crate::serde_utils::vec3")]`. Values are written as
//! plain float arrays so snapshots stay readable in JSON and YAML.

macro_rules! array_adapter {
    ($name:ident, $ty:ty, $len:expr, $to:expr, $from:expr) => {
        pub mod $name {
            use serde::{Deserialize, Deserializer, Serialize, Serializer};

            pub fn serialize<S>(value: &$ty, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let array: [f32; $len] = $to(value);
                array.serialize(s)
            }

            pub fn deserialize<'de, D>(d: D) -> Result<$ty, D::Error>
            where
                D: Deserializer<'de>,
            {
                <[f32; $len]>::deserialize(d).map($from)
            }
        }
    };
}

array_adapter!(
    vec3,
    glam::Vec3,
    3,
    |v: &glam::Vec3| v.to_array(),
    |a: [f32; 3]| glam::Vec3::from_array(a)
);

array_adapter!(
    quat,
    glam::Quat,
    4,
    |q: &glam::Quat| q.to_array(),
    |a: [f32; 4]| glam::Quat::from_array(a)
);

array_adapter!(
    mat3,
    glam::Mat3,
    9,
    |m: &glam::Mat3| m.to_cols_array(),
    |a: [f32; 9]| glam::Mat3::from_cols_array(&a)
);

#[cfg(test)]
mod tests {
    use glam::{Mat3, Quat, Vec3};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Pose {
        #[serde(with = "super::vec3")]
        position: Vec3,
        #[serde(with = "super::quat")]
        rotation: Quat,
        #[serde(with = "super::mat3")]
        inertia: Mat3,
    }

    #[test]
    fn test_pose_json_is_flat_arrays() {
        let pose = Pose {
            position: Vec3::new(1.0, 2.0, 3.0),
            rotation: Quat::IDENTITY,
            inertia: Mat3::IDENTITY,
        };
        let json = serde_json::to_string(&pose).unwrap();
        assert!(json.contains("\"position\":[1.0,2.0,3.0]"), "got {json}");

        let back: Pose = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pose);
    }
}
