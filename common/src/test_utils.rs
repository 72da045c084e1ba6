//! Quickly assert serialization roundtrips for various types.

pub mod roundtrip {
    use proptest::arbitrary::Arbitrary;
    use proptest::proptest;
    use proptest::strategy::Strategy;
    use proptest::test_runner::Config;
    use serde::de::DeserializeOwned;
    use serde::Serialize;

    /// Assert that a type roundtrips to/from a [`serde_json::Value`].
    pub fn json_value_roundtrip_proptest<T>()
    where
        T: Arbitrary + PartialEq + Serialize + DeserializeOwned,
    {
        proptest!(|(value1: T)| {
            let json_value1 = serde_json::to_value(&value1).unwrap();
            let value2 = serde_json::from_value::<T>(json_value1.clone()).unwrap();
            let json_value2 = serde_json::to_value(&value2).unwrap();

            assert!(value1 == value2);
            assert_eq!(json_value1, json_value2);
        });
    }

    /// [`json_value_roundtrip_proptest`] with a custom strategy and config,
    /// for types whose [`Arbitrary`] impl is impractical.
    pub fn json_value_custom<T>(strategy: impl Strategy<Value = T>, config: Config)
    where
        T: PartialEq + Serialize + DeserializeOwned + std::fmt::Debug,
    {
        proptest!(config, |(value1 in strategy)| {
            let json_value1 = serde_json::to_value(&value1).unwrap();
            let value2 = serde_json::from_value::<T>(json_value1.clone()).unwrap();
            let json_value2 = serde_json::to_value(&value2).unwrap();

            assert!(value1 == value2);
            assert_eq!(json_value1, json_value2);
        });
    }

    /// Assert that a type roundtrips through its JSON *string* form.
    pub fn json_string_roundtrip_proptest<T>()
    where
        T: Arbitrary + PartialEq + Serialize + DeserializeOwned,
    {
        proptest!(|(value1: T)| {
            let json_str1 = serde_json::to_string(&value1).unwrap();
            let value2 = serde_json::from_str::<T>(&json_str1).unwrap();
            let json_str2 = serde_json::to_string(&value2).unwrap();

            assert!(value1 == value2);
            assert_eq!(json_str1, json_str2);
        });
    }
}

pub mod arbitrary {
    use proptest::prelude::*;
    use proptest::string::string_regex;

    /// A strategy for small, JSON-safe ASCII strings.
    pub fn simple_string() -> impl Strategy<Value = String> {
        string_regex("[a-zA-Z0-9 _.:-]{0,16}").unwrap()
    }

    /// A strategy for shallow opaque [`serde_json::Value`]s, standing in for
    /// the module-defined payloads the engine never introspects.
    pub fn json_value() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i32>().prop_map(serde_json::Value::from),
            simple_string().prop_map(serde_json::Value::from),
        ];
        prop::collection::btree_map(simple_string(), leaf, 0..4).prop_map(|m| {
            serde_json::Value::Object(m.into_iter().collect())
        })
    }
}
