//! Generational token allocation for registered handles.
//!
//! A token packs `(generation, slot)`. Slots are reused after removal with a
//! bumped generation, so a readiness event that raced with `close()` and
//! carries an old token is simply not found.

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Index {
  generation: u32,
  slot: u32,
}

impl Index {
  /// High 32 bits = generation, low 32 bits = slot.
  fn as_u64(self) -> u64 {
    ((self.generation as u64) << 32) | (self.slot as u64)
  }

  fn from_u64(packed: u64) -> Self {
    Index { slot: (packed & 0xFFFF_FFFF) as u32, generation: (packed >> 32) as u32 }
  }
}

struct Slot<T> {
  generation: u32,
  value: Option<T>,
}

pub(crate) struct TokenStore<T> {
  slots: Vec<Slot<T>>,
  free: Vec<u32>,
}

impl<T> Default for TokenStore<T> {
  fn default() -> Self {
    Self { slots: Vec::new(), free: Vec::new() }
  }
}

impl<T> TokenStore<T> {
  #[cfg(test)]
  pub fn insert(&mut self, value: T) -> u64 {
    self.insert_with(|_| value).0
  }

  /// Inserts a value that needs to know its own token.
  pub fn insert_with(&mut self, make: impl FnOnce(u64) -> T) -> (u64, &T) {
    let index = match self.free.pop() {
      Some(slot) => {
        let entry = &mut self.slots[slot as usize];
        entry.generation = entry.generation.wrapping_add(1);
        Index { slot, generation: entry.generation }
      }
      None => {
        let slot = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, value: None });
        Index { slot, generation: 0 }
      }
    };
    let token = index.as_u64();
    let value = self.slots[index.slot as usize].value.insert(make(token));
    (token, value)
  }

  pub fn get(&self, token: u64) -> Option<&T> {
    let index = Index::from_u64(token);
    let entry = self.slots.get(index.slot as usize)?;
    if entry.generation == index.generation { entry.value.as_ref() } else { None }
  }

  pub fn remove(&mut self, token: u64) -> Option<T> {
    let index = Index::from_u64(token);
    let entry = self.slots.get_mut(index.slot as usize)?;
    if entry.generation != index.generation {
      return None;
    }
    let value = entry.value.take()?;
    self.free.push(index.slot);
    Some(value)
  }

  /// Empties the store, handing back every live value.
  pub fn drain(&mut self) -> Vec<T> {
    self.free.clear();
    self.slots.drain(..).filter_map(|slot| slot.value).collect()
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.slots.len() - self.free.len()
  }
}
