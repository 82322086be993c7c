// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Data frames returned by `POST /api/ds/query`.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub results: BTreeMap<String, QueryResultGroup>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryResultGroup {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub frames: Vec<Frame>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub schema: Option<FrameSchema>,
    #[serde(default)]
    pub data: Option<FrameData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameSchema {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Field {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub config: Option<FieldConfig>,
}

impl Field {
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind.as_deref() == Some(kind)
    }

    pub fn display_name(&self) -> Option<&str> {
        let config = self.config.as_ref();
        config
            .and_then(|config| config.display_name_from_ds.as_deref())
            .or_else(|| config.and_then(|config| config.display_name.as_deref()))
            .or(self.name.as_deref())
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConfig {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, rename = "displayNameFromDS")]
    pub display_name_from_ds: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrameData {
    #[serde(default, deserialize_with = "null_as_default")]
    pub values: Vec<Vec<Value>>,
    /// Per-field positions of values JSON cannot carry; the matching slots in
    /// `values` hold `null`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub entities: Vec<Option<FieldEntities>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldEntities {
    #[serde(default, rename = "NaN")]
    pub nan: Vec<usize>,
    #[serde(default, rename = "Inf")]
    pub inf: Vec<usize>,
    #[serde(default, rename = "NegInf")]
    pub neg_inf: Vec<usize>,
}

impl FieldEntities {
    pub fn special_at(&self, index: usize) -> Option<&'static str> {
        if self.nan.contains(&index) {
            Some("NaN")
        } else if self.inf.contains(&index) {
            Some("+Inf")
        } else if self.neg_inf.contains(&index) {
            Some("-Inf")
        } else {
            None
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}
