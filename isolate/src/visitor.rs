use crate::{ClassDef, HeapObject, ObjectId, Unit, UnitId, Value};

pub trait Visitable {
    fn visit_edges(&self, visitor: &mut impl Visitor);
}

pub trait Visitor: Sized {
    fn visit(&mut self, value: &Value) {
        let _ = value;
    }

    /// Lexical parent of a closure.
    fn visit_upper(&mut self, proc: ObjectId) {
        let _ = proc;
    }

    fn visit_unit(&mut self, unit: UnitId) {
        let _ = unit;
    }
}

// Visiting an object means visiting its direct edges only; the visitor
// decides whether to follow them.
impl Visitable for HeapObject {
    fn visit_edges(&self, visitor: &mut impl Visitor) {
        match self {
            HeapObject::String(_) => (),
            HeapObject::Array(items) => items.iter().for_each(|v| visitor.visit(v)),
            HeapObject::Hash(hash) => {
                for (k, v) in hash.iter() {
                    visitor.visit(k);
                    visitor.visit(v);
                }
            }
            HeapObject::Range(range) => {
                visitor.visit(&range.begin);
                visitor.visit(&range.end);
            }
            HeapObject::Object(object) => object.ivars.values().for_each(|v| visitor.visit(v)),
            HeapObject::Exception(exc) => {
                visitor.visit(&exc.message);
                exc.ivars.values().for_each(|v| visitor.visit(v));
            }
            HeapObject::Proc(proc) => {
                visitor.visit_unit(proc.unit);
                proc.env.iter().for_each(|v| visitor.visit(v));
                if let Some(upper) = proc.upper {
                    visitor.visit_upper(upper);
                }
            }
        }
    }
}

impl Visitable for Unit {
    fn visit_edges(&self, visitor: &mut impl Visitor) {
        self.literals.iter().for_each(|v| visitor.visit(v));
        self.children.iter().for_each(|&c| visitor.visit_unit(c));
    }
}

impl Visitable for ClassDef {
    fn visit_edges(&self, visitor: &mut impl Visitor) {
        self.consts.values().for_each(|v| visitor.visit(v));
    }
}
