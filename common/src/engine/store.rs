use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Mutex,
};

use crate::error::StoreError;

/// Una instanciación independiente del pipeline (p.ej. una muestra).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunTag {
    pub name: String,
    pub id: i64,
}

impl RunTag {
    pub fn new(name: impl Into<String>, id: i64) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

/// Unidad de trabajo descubierta dentro de un split-join, acotada a una corrida.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkTag {
    pub chunk: u32,
    pub run: RunTag,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    Run(RunTag),
    Chunk(ChunkTag),
}

impl Tag {
    pub fn run_tag(&self) -> &RunTag {
        match self {
            Tag::Run(run) => run,
            Tag::Chunk(chunk) => &chunk.run,
        }
    }

    pub fn chunk(&self) -> Option<u32> {
        match self {
            Tag::Run(_) => None,
            Tag::Chunk(c) => Some(c.chunk),
        }
    }
}

impl From<RunTag> for Tag {
    fn from(run: RunTag) -> Self {
        Tag::Run(run)
    }
}

impl From<ChunkTag> for Tag {
    fn from(chunk: ChunkTag) -> Self {
        Tag::Chunk(chunk)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Run(r) => write!(f, "{}#{}", r.name, r.id),
            Tag::Chunk(c) => write!(f, "{}#{}/{}", c.run.name, c.run.id, c.chunk),
        }
    }
}

/// Clave de un item: colección + tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub collection: String,
    pub tag: Tag,
}

impl ItemKey {
    pub fn new(collection: impl Into<String>, tag: impl Into<Tag>) -> Self {
        Self {
            collection: collection.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.collection, self.tag)
    }
}

struct Parked<W> {
    waiter: W,
    missing: HashSet<ItemKey>,
}

struct StoreInner<W> {
    items: HashMap<ItemKey, Value>,
    tags: HashSet<(String, Tag)>,
    /// item faltante -> ids de los pasos estacionados que lo esperan
    waiting_on: HashMap<ItemKey, Vec<u64>>,
    parked: HashMap<u64, Parked<W>>,
    next_park: u64,
}

/// Almacén de asignación única compartido por todos los pasos.
///
/// Cada clave se escribe a lo sumo una vez. Un paso al que le faltan
/// entradas se estaciona con la cuenta de claves que espera; cuando
/// la última llega, `put` lo devuelve para que el scheduler lo re-encole.
pub struct ItemStore<W> {
    inner: Mutex<StoreInner<W>>,
}

impl<W> Default for ItemStore<W> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                items: HashMap::new(),
                tags: HashSet::new(),
                waiting_on: HashMap::new(),
                parked: HashMap::new(),
                next_park: 0,
            }),
        }
    }
}

impl<W> ItemStore<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Escribe el item y devuelve los pasos que quedaron listos.
    /// Una segunda escritura de la misma clave es un error y no pisa el valor.
    pub fn put(&self, key: ItemKey, value: Value) -> Result<Vec<W>, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.items.contains_key(&key) {
            return Err(StoreError::AlreadyWritten(key.to_string()));
        }

        let waiters = inner.waiting_on.remove(&key).unwrap_or_default();
        let mut ready = Vec::new();
        for park_id in waiters {
            let done = match inner.parked.get_mut(&park_id) {
                Some(parked) => {
                    parked.missing.remove(&key);
                    parked.missing.is_empty()
                }
                None => false,
            };
            if done {
                if let Some(parked) = inner.parked.remove(&park_id) {
                    ready.push(parked.waiter);
                }
            }
        }

        inner.items.insert(key, value);
        Ok(ready)
    }

    pub fn get(&self, key: &ItemKey) -> Option<Value> {
        self.inner.lock().unwrap().items.get(key).cloned()
    }

    /// Estaciona `waiter` hasta que existan todas las claves de `missing`.
    ///
    /// Vuelve a comprobar bajo el lock: si mientras tanto llegaron todas,
    /// devuelve el waiter para re-ejecutarlo de inmediato.
    pub fn park(&self, waiter: W, missing: Vec<ItemKey>) -> Option<W> {
        let mut inner = self.inner.lock().unwrap();

        let missing: HashSet<ItemKey> = missing
            .into_iter()
            .filter(|k| !inner.items.contains_key(k))
            .collect();

        if missing.is_empty() {
            return Some(waiter);
        }

        let park_id = inner.next_park;
        inner.next_park += 1;
        for key in &missing {
            inner
                .waiting_on
                .entry(key.clone())
                .or_default()
                .push(park_id);
        }
        inner.parked.insert(park_id, Parked { waiter, missing });
        None
    }

    /// Registra `tag` en la colección de tags. Devuelve `false` si ya existía.
    pub fn insert_tag(&self, collection: &str, tag: Tag) -> bool {
        self.inner
            .lock()
            .unwrap()
            .tags
            .insert((collection.to_string(), tag))
    }

    pub fn item_count(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }
}

impl<W: Clone> ItemStore<W> {
    /// Pasos que siguen estacionados, con las claves que les faltan.
    pub fn stalled(&self) -> Vec<(W, Vec<ItemKey>)> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<&u64> = inner.parked.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| {
                let parked = &inner.parked[id];
                let mut missing: Vec<ItemKey> = parked.missing.iter().cloned().collect();
                missing.sort_by_key(|k| k.to_string());
                (parked.waiter.clone(), missing)
            })
            .collect()
    }
}
