//! The tagged value type crossing the host/script boundary.
//!
//! Scripts are dynamically typed; the host is not. Every value that crosses
//! between them goes through [`ScriptValue`] — an explicit
//! nil/bool/int/float/string/array/map union — so the conversion rules live
//! in exactly one place instead of leaking native interop assumptions
//! through the bridge.
//!
//! Numeric rule: host integers stay integers through the crossing (Lua 5.4
//! distinguishes integer and float subtypes), and values within the IEEE-754
//! safe-integer range survive a round trip through JSON losslessly.

use std::collections::BTreeMap;

use mlua::{Lua, Value as LuaValue};

/// A value exchanged between the host and a sandboxed script.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Ordered sequence (Lua array part, JSON array).
    Array(Vec<ScriptValue>),
    /// String-keyed map. Ordered by key for deterministic encoding.
    Map(BTreeMap<String, ScriptValue>),
}

impl ScriptValue {
    // -- JSON ----------------------------------------------------------------

    /// Converts a JSON value into a [`ScriptValue`].
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Nil,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Self::Array(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts this value into JSON.
    ///
    /// Non-finite floats have no JSON representation and become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Nil => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::Number((*i).into()),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    // -- Lua -----------------------------------------------------------------

    /// Materializes this value inside the given interpreter.
    pub fn to_lua(&self, lua: &Lua) -> mlua::Result<LuaValue> {
        Ok(match self {
            Self::Nil => LuaValue::Nil,
            Self::Bool(b) => LuaValue::Boolean(*b),
            Self::Int(i) => LuaValue::Integer(*i),
            Self::Float(f) => LuaValue::Number(*f),
            Self::Str(s) => LuaValue::String(lua.create_string(s)?),
            Self::Array(items) => {
                let table = lua.create_table()?;
                for (i, item) in items.iter().enumerate() {
                    table.raw_set(i + 1, item.to_lua(lua)?)?;
                }
                LuaValue::Table(table)
            }
            Self::Map(map) => {
                let table = lua.create_table()?;
                for (k, v) in map {
                    table.raw_set(k.as_str(), v.to_lua(lua)?)?;
                }
                LuaValue::Table(table)
            }
        })
    }

    /// Reads a Lua value back into a [`ScriptValue`].
    ///
    /// Tables with a non-empty array part become arrays; everything else
    /// becomes a string-keyed map (non-string keys are dropped). Values with
    /// no host representation (functions, userdata) become their string form.
    pub fn from_lua(value: &LuaValue) -> mlua::Result<Self> {
        Ok(match value {
            LuaValue::Nil => Self::Nil,
            LuaValue::Boolean(b) => Self::Bool(*b),
            LuaValue::Integer(i) => Self::Int(*i),
            LuaValue::Number(n) => Self::Float(*n),
            LuaValue::String(s) => Self::Str(s.to_string_lossy().to_string()),
            LuaValue::Table(table) => {
                let len = table.raw_len();
                if len > 0 {
                    let mut items = Vec::with_capacity(len);
                    for i in 1..=len {
                        let item: LuaValue = table.raw_get(i)?;
                        items.push(Self::from_lua(&item)?);
                    }
                    Self::Array(items)
                } else {
                    let mut map = BTreeMap::new();
                    for pair in table.clone().pairs::<LuaValue, LuaValue>() {
                        let (key, val) = pair?;
                        if let LuaValue::String(key) = key {
                            map.insert(
                                key.to_string_lossy().to_string(),
                                Self::from_lua(&val)?,
                            );
                        }
                    }
                    Self::Map(map)
                }
            }
            other => Self::Str(format!("{other:?}")),
        })
    }

    /// Builds a map value from a JSON object-like iterator. Used for static
    /// plugin config.
    pub fn map_from_json<'a>(
        entries: impl IntoIterator<Item = (&'a String, &'a serde_json::Value)>,
    ) -> Self {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.clone(), Self::from_json(v)))
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_preserves_structure() {
        let json = serde_json::json!({
            "enabled": true,
            "count": 42,
            "ratio": 1.5,
            "name": "herald",
            "tags": ["a", "b", "c"],
            "nested": {
                "deep": [{"k": 1}, {"k": 2}],
                "none": null
            }
        });

        let value = ScriptValue::from_json(&json);
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn json_integers_stay_integers() {
        let json = serde_json::json!({"big": 9_007_199_254_740_991_i64});
        let value = ScriptValue::from_json(&json);
        match &value {
            ScriptValue::Map(map) => {
                assert_eq!(map["big"], ScriptValue::Int(9_007_199_254_740_991));
            }
            other => panic!("expected map, got {other:?}"),
        }
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn lua_round_trip_preserves_structure() {
        let lua = Lua::new();
        let original = ScriptValue::Map(BTreeMap::from([
            ("flag".to_owned(), ScriptValue::Bool(false)),
            ("n".to_owned(), ScriptValue::Int(7)),
            ("pi".to_owned(), ScriptValue::Float(3.25)),
            ("s".to_owned(), ScriptValue::Str("text".to_owned())),
            (
                "list".to_owned(),
                ScriptValue::Array(vec![
                    ScriptValue::Int(1),
                    ScriptValue::Int(2),
                    ScriptValue::Int(3),
                ]),
            ),
        ]));

        let lua_value = original.to_lua(&lua).unwrap();
        let back = ScriptValue::from_lua(&lua_value).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn lua_integer_and_float_stay_distinct() {
        let lua = Lua::new();

        let int_val = ScriptValue::Int(5).to_lua(&lua).unwrap();
        assert!(matches!(int_val, LuaValue::Integer(5)));

        let float_val = ScriptValue::Float(5.0).to_lua(&lua).unwrap();
        assert!(matches!(float_val, LuaValue::Number(n) if n == 5.0));
    }

    #[test]
    fn lua_array_detection() {
        let lua = Lua::new();
        let value: LuaValue = lua.load("return {10, 20, 30}").eval().unwrap();
        let script = ScriptValue::from_lua(&value).unwrap();
        assert_eq!(
            script,
            ScriptValue::Array(vec![
                ScriptValue::Int(10),
                ScriptValue::Int(20),
                ScriptValue::Int(30),
            ])
        );
    }

    #[test]
    fn lua_empty_table_is_map() {
        let lua = Lua::new();
        let value: LuaValue = lua.load("return {}").eval().unwrap();
        let script = ScriptValue::from_lua(&value).unwrap();
        assert_eq!(script, ScriptValue::Map(BTreeMap::new()));
    }

    #[test]
    fn lua_non_string_keys_dropped() {
        let lua = Lua::new();
        let value: LuaValue = lua
            .load(r#"return {name = "x", [true] = "dropped"}"#)
            .eval()
            .unwrap();
        let script = ScriptValue::from_lua(&value).unwrap();
        assert_eq!(
            script,
            ScriptValue::Map(BTreeMap::from([(
                "name".to_owned(),
                ScriptValue::Str("x".to_owned())
            )]))
        );
    }

    #[test]
    fn non_finite_float_encodes_as_null() {
        assert_eq!(
            ScriptValue::Float(f64::INFINITY).to_json(),
            serde_json::Value::Null
        );
    }

    #[test]
    fn map_from_json_builds_config() {
        let config = std::collections::HashMap::from([
            ("path".to_owned(), serde_json::json!("/tmp/x")),
            ("retries".to_owned(), serde_json::json!(3)),
        ]);
        let value = ScriptValue::map_from_json(&config);
        match value {
            ScriptValue::Map(map) => {
                assert_eq!(map["path"], ScriptValue::Str("/tmp/x".to_owned()));
                assert_eq!(map["retries"], ScriptValue::Int(3));
            }
            other => panic!("expected map, got {other:?}"),
        }
    }
}
