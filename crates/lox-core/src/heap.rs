//! heap.rs — arène d'objets, table d'internement et collecteur mark-sweep.
//!
//! Le tas est une arène (`Vec<Option<Obj>>`) indexée par [`ObjHandle`] : pas
//! de pointeurs bruts, pas d'`unsafe`. Les emplacements libérés par un
//! `sweep` sont recyclés via `free_list`, donc les handles restent des
//! `u32` compacts même sur un programme qui alloue beaucoup.
//!
//! Les racines (pile VM, globals, upvalues ouvertes, fonctions en cours de
//! compilation…) ne sont pas connues du tas : l'appelant implémente
//! [`GcRoots`] et le tas l'invoque au moment de marquer.

use ahash::AHashMap;
use tracing::debug;

use crate::object::{fnv1a, LoxString, Obj};
use crate::value::Value;
use crate::ObjHandle;

/// Bilan d'une collecte, exposé pour le diagnostic (`--gc-log`, tests).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub live_objects: usize,
    pub collections_run: usize,
}

/// Racines GC externes au tas : tout ce que la VM (ou le compilateur, pour
/// les fonctions en cours de construction) garde vivant indépendamment du
/// graphe d'objets atteignable depuis d'autres objets.
pub trait GcRoots {
    /// Marque chaque racine via `heap.mark_value`/`heap.mark_object`.
    fn mark_roots(&self, heap: &mut Heap);
}

/// Tas à arène pour les objets Lox, avec internement de chaînes et
/// collecteur mark-and-sweep tri-color.
#[derive(Debug)]
pub struct Heap {
    objects: Vec<Option<Obj>>,
    marked: Vec<bool>,
    free_list: Vec<u32>,
    /// hash -> handles candidats (collisions possibles), pour l'internement.
    strings: AHashMap<u64, Vec<ObjHandle>>,
    gray_stack: Vec<ObjHandle>,
    allocations_since_gc: usize,
    next_gc_threshold: usize,
    stats: HeapStats,
    /// Équivalent `DEBUG_STRESS_GC` : force une collecte à chaque point de
    /// sécurité GC atteint (voir `should_collect`). Le point de sécurité est
    /// la frontière d'instruction de la VM, pas chaque allocation
    /// individuelle — les racines n'étant connues qu'à cette frontière-là,
    /// c'est le grain le plus fin que cette conception arène puisse offrir
    /// sans faire du compilateur une racine GC.
    pub stress_gc: bool,
    /// Journalise chaque collecte via `tracing`.
    pub log_gc: bool,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    const INITIAL_GC_THRESHOLD: usize = 256;
    const GROW_FACTOR: usize = 2;

    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            marked: Vec::new(),
            free_list: Vec::new(),
            strings: AHashMap::new(),
            gray_stack: Vec::new(),
            allocations_since_gc: 0,
            next_gc_threshold: Self::INITIAL_GC_THRESHOLD,
            stats: HeapStats::default(),
            stress_gc: false,
            log_gc: false,
        }
    }

    /// Alloue un objet quelconque et renvoie son handle. N'interne pas les
    /// chaînes — utiliser [`Heap::intern`] pour ça.
    pub fn alloc(&mut self, obj: Obj) -> ObjHandle {
        self.allocations_since_gc += 1;
        let handle = match self.free_list.pop() {
            Some(idx) => {
                self.objects[idx as usize] = Some(obj);
                self.marked[idx as usize] = false;
                ObjHandle(idx)
            }
            None => {
                self.objects.push(Some(obj));
                self.marked.push(false);
                ObjHandle((self.objects.len() - 1) as u32)
            }
        };
        self.stats.live_objects += 1;
        handle
    }

    /// Interne une chaîne : renvoie le handle existant si une chaîne égale
    /// vit déjà sur le tas, sinon en alloue une nouvelle. Garantit que deux
    /// `Value::Obj` portant la même chaîne comparent égaux par handle.
    pub fn intern(&mut self, bytes: &str) -> ObjHandle {
        let hash = fnv1a(bytes.as_bytes());
        if let Some(candidates) = self.strings.get(&hash) {
            for &handle in candidates {
                if let Some(Obj::Str(s)) = self.get(handle) {
                    if s.bytes == bytes {
                        return handle;
                    }
                }
            }
        }
        let handle = self.alloc(Obj::Str(LoxString::new(bytes.to_string())));
        self.strings.entry(hash).or_default().push(handle);
        handle
    }

    /// Accès en lecture à un objet.
    pub fn get(&self, handle: ObjHandle) -> Option<&Obj> {
        self.objects.get(handle.index()).and_then(|slot| slot.as_ref())
    }

    /// Accès en écriture à un objet (mutation de champs d'instance, etc.).
    pub fn get_mut(&mut self, handle: ObjHandle) -> Option<&mut Obj> {
        self.objects.get_mut(handle.index()).and_then(|slot| slot.as_mut())
    }

    /// `true` si une collecte est recommandée avant la prochaine allocation
    /// (utilisé par la VM pour décider quand appeler `collect_garbage`).
    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.allocations_since_gc >= self.next_gc_threshold
    }

    /// Marque un objet atteignable (et le met en file grise s'il ne l'était
    /// pas déjà), sans suivre ses propres références : voir
    /// [`Heap::trace_references`] pour ça.
    pub fn mark_object(&mut self, handle: ObjHandle) {
        if let Some(marked) = self.marked.get_mut(handle.index()) {
            if !*marked {
                *marked = true;
                self.gray_stack.push(handle);
            }
        }
    }

    /// Marque la valeur si elle référence un objet tas.
    pub fn mark_value(&mut self, value: &Value) {
        if let Value::Obj(handle) = value {
            self.mark_object(*handle);
        }
    }

    /// Lance une collecte complète : marque les racines fournies par
    /// `roots`, propage le marquage aux objets atteignables, puis balaie
    /// les objets non marqués.
    pub fn collect_garbage(&mut self, roots: &impl GcRoots) {
        let before = self.stats.live_objects;
        if self.log_gc {
            debug!(live_objects = before, "gc begin");
        }

        roots.mark_roots(self);
        self.trace_references();
        self.sweep();

        self.allocations_since_gc = 0;
        self.next_gc_threshold = self.stats.live_objects.max(Self::INITIAL_GC_THRESHOLD) * Self::GROW_FACTOR;
        self.stats.collections_run += 1;

        if self.log_gc {
            debug!(before, after = self.stats.live_objects, "gc end");
        }
    }

    fn trace_references(&mut self) {
        while let Some(handle) = self.gray_stack.pop() {
            self.blacken(handle);
        }
    }

    fn blacken(&mut self, handle: ObjHandle) {
        let Some(obj) = self.get(handle) else { return };
        match obj.clone() {
            Obj::Str(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    self.mark_object(name);
                }
                for constant in f.chunk.constants().to_vec() {
                    self.mark_value(&constant);
                }
            }
            Obj::Closure(c) => {
                self.mark_object(c.function);
                for upvalue in c.upvalues {
                    self.mark_object(upvalue);
                }
            }
            Obj::Upvalue(crate::object::Upvalue::Closed(value)) => {
                self.mark_value(&value);
            }
            Obj::Upvalue(crate::object::Upvalue::Open(_)) => {}
            Obj::Class(class) => {
                self.mark_object(class.name);
                for (key, method) in class.methods {
                    self.mark_object(key);
                    self.mark_object(method);
                }
            }
            Obj::Instance(instance) => {
                self.mark_object(instance.class);
                for (key, value) in instance.fields {
                    self.mark_object(key);
                    self.mark_value(&value);
                }
            }
            Obj::BoundMethod(bound) => {
                self.mark_value(&bound.receiver);
                self.mark_object(bound.method);
            }
        }
    }

    fn sweep(&mut self) {
        for idx in 0..self.objects.len() {
            if self.objects[idx].is_none() {
                continue;
            }
            if self.marked[idx] {
                self.marked[idx] = false;
            } else {
                if let Some(Obj::Str(s)) = &self.objects[idx] {
                    if let Some(bucket) = self.strings.get_mut(&s.hash) {
                        bucket.retain(|h| h.index() != idx);
                    }
                }
                self.objects[idx] = None;
                self.free_list.push(idx as u32);
                self.stats.live_objects -= 1;
            }
        }
    }

    /// Bilan courant, pour diagnostic.
    pub fn stats(&self) -> HeapStats {
        self.stats
    }
}

/// Rend une valeur en texte tel qu'imprimé par `print` (§4.5/§5).
pub fn render(value: &Value, heap: &Heap) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => render_number(*n),
        Value::Obj(handle) => render_object(*handle, heap),
    }
}

fn render_number(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    format!("{n}")
}

fn render_object(handle: ObjHandle, heap: &Heap) -> String {
    match heap.get(handle) {
        Some(Obj::Str(s)) => s.bytes.clone(),
        Some(Obj::Function(f)) => match f.name {
            Some(name) => format!("<fn {}>", render_object(name, heap)),
            None => "<script>".to_string(),
        },
        Some(Obj::Native(_)) => "<native fn>".to_string(),
        Some(Obj::Closure(c)) => render_object(c.function, heap),
        Some(Obj::Upvalue(_)) => "upvalue".to_string(),
        Some(Obj::Class(c)) => render_object(c.name, heap),
        Some(Obj::Instance(i)) => format!("{} instance", render_object(i.class, heap)),
        Some(Obj::BoundMethod(b)) => render_object(b.method, heap),
        None => "<invalid object>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRoots;
    impl GcRoots for NoRoots {
        fn mark_roots(&self, _heap: &mut Heap) {}
    }

    #[test]
    fn interning_returns_same_handle_for_equal_strings() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
    }

    #[test]
    fn interning_distinguishes_different_strings() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("world");
        assert_ne!(a, b);
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let mut heap = Heap::new();
        heap.intern("garbage");
        assert_eq!(heap.stats().live_objects, 1);
        heap.collect_garbage(&NoRoots);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn rooted_objects_survive_collection() {
        let mut heap = Heap::new();
        let handle = heap.intern("kept");

        struct KeepOne(ObjHandle);
        impl GcRoots for KeepOne {
            fn mark_roots(&self, heap: &mut Heap) {
                heap.mark_object(self.0);
            }
        }

        heap.collect_garbage(&KeepOne(handle));
        assert_eq!(heap.stats().live_objects, 1);
        assert!(heap.get(handle).is_some());
    }

    #[test]
    fn render_formats_numbers_without_trailing_zero() {
        let heap = Heap::new();
        assert_eq!(render(&Value::Number(1.0), &heap), "1");
        assert_eq!(render(&Value::Number(1.5), &heap), "1.5");
    }

    #[test]
    fn render_formats_nil_and_bool() {
        let heap = Heap::new();
        assert_eq!(render(&Value::Nil, &heap), "nil");
        assert_eq!(render(&Value::Bool(true), &heap), "true");
    }
}
