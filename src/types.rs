use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// 画像パスとクラスIDの組
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
}

impl Sample {
    pub fn new(path: PathBuf, label: usize) -> Self {
        Self { path, label }
    }
}

/// クラス名 <-> クラスID の対応表
///
/// フォルダ名の辞書順でIDを割り当てる。1回の学習の間は不変。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCatalog {
    names: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl ClassCatalog {
    /// クラス名の集合から作成（重複は除去、辞書順にソート）
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();

        let index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        Self { names, index }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// クラスIDからクラス名
    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// クラス名からクラスID
    pub fn index_of(&self, name: &str) -> Option<usize> {
        if self.index.is_empty() && !self.names.is_empty() {
            // デシリアライズ直後はインデックス未構築
            return self.names.iter().position(|n| n == name);
        }
        self.index.get(name).copied()
    }
}
