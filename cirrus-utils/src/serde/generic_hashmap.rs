//! Module that allows to (de-)serialize a generic `HashMap` with `serde`.

use std::{collections::HashMap, hash::Hash};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Helper struct that allows (de-)serialization of a single entry.
#[derive(Deserialize, Serialize)]
struct Entry<K, V> {
    key: K,
    val: V,
}

/// Serialize a HashMap whose Key is a tuple of serializable
///
/// NOTE: taken from <https://github.com/serde-rs/json/issues/456>
pub fn serialize<K: Serialize, V: Serialize, S: Serializer>(
    map: &HashMap<K, V>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(map.iter().map(|(key, val)| Entry { key, val }))
}

/// Deserialize a HashMap whose Key is a tuple of serializable
///
/// NOTE: taken from <https://github.com/serde-rs/json/issues/456>
pub fn deserialize<'de, K: Deserialize<'de> + Eq + Hash, V: Deserialize<'de>, D>(
    deserializer: D,
) -> Result<HashMap<K, V>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Vec::<Entry<K, V>>::deserialize(deserializer)?
        .into_iter()
        .map(|e| (e.key, e.val))
        .collect())
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Links(#[serde(with = "super")] HashMap<(String, String), String>);

    #[test]
    fn tuple_keys_roundtrip() {
        let links = Links(HashMap::from_iter([(
            ("eu-central-1".to_string(), "eu-west-2".to_string()),
            "pcx-00000001".to_string(),
        )]));

        let json = serde_json::to_string(&links).unwrap();
        let parsed: Links = serde_json::from_str(&json).unwrap();

        assert_eq!(links, parsed);
    }
}
