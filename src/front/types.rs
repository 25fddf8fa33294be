//! The type system: canonicalised, interned types with size/alignment.
//!
//! Every [`Ty`] is an [`internment::Intern`] handle, so two types built from
//! the same declarator text are pointer-equal. Struct/union bodies are the
//! one kind of type that can't be interned structurally up front (the fields
//! aren't known until the closing brace, and a struct can point to itself
//! through a pointer), so
//! they're tracked by index into [`TypeTable`] instead; `Ty::Struct(id)`
//! values are still interned, just over the index rather than the body.

use crate::common::Id;
use internment::Intern;

pub type Ty = Intern<TypeKind>;

pub const QUAL_CONST: u8 = 1;
pub const QUAL_VOLATILE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    /// An integral type: `size` in bytes is one of 1/2/4/8.
    Fixnum { size: u8, signed: bool },
    /// A floating type: `size` in bytes is 4 (float) or 8 (double).
    Flonum { size: u8 },
    Pointer(Ty),
    /// `count` is `None` for an incomplete array (`extern int a[];`).
    Array(Ty, Option<usize>),
    Struct(u32),
    Function {
        ret: Ty,
        params: Vec<Ty>,
        vaargs: bool,
    },
    Qualified(Ty, u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField {
    pub width: u8,
    pub bit_offset: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: Id,
    pub ty: Ty,
    pub offset: u32,
    pub bitfield: Option<BitField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StructDef {
    pub tag: Option<Id>,
    pub is_union: bool,
    pub fields: Vec<Field>,
    pub size: u32,
    pub align: u32,
    pub complete: bool,
}

/// Owns every struct/union body declared in the translation unit and knows
/// the target's pointer size, which the rest of type construction depends on.
pub struct TypeTable {
    pub ptr_size: u8,
    structs: Vec<StructDef>,
    /// (tag, defining-scope-id) -> struct index: struct and union
    /// declarations are uniqued by (tag, scope); anonymous structs (no tag)
    /// never go in this map, so every
    /// anonymous struct gets a fresh index.
    by_tag: crate::common::Map<(Id, u32), u32>,
}

impl TypeTable {
    pub fn new(ptr_size: u8) -> TypeTable {
        TypeTable {
            ptr_size,
            structs: Vec::new(),
            by_tag: crate::common::Map::new(),
        }
    }

    pub fn void() -> Ty {
        Intern::new(TypeKind::Void)
    }

    pub fn fixnum(size: u8, signed: bool) -> Ty {
        Intern::new(TypeKind::Fixnum { size, signed })
    }

    pub fn flonum(size: u8) -> Ty {
        Intern::new(TypeKind::Flonum { size })
    }

    pub fn pointer(to: Ty) -> Ty {
        Intern::new(TypeKind::Pointer(to))
    }

    pub fn array(of: Ty, count: Option<usize>) -> Ty {
        Intern::new(TypeKind::Array(of, count))
    }

    pub fn function(ret: Ty, params: Vec<Ty>, vaargs: bool) -> Ty {
        Intern::new(TypeKind::Function { ret, params, vaargs })
    }

    pub fn qualified(inner: Ty, quals: u8) -> Ty {
        if quals == 0 {
            return inner;
        }
        Intern::new(TypeKind::Qualified(inner, quals))
    }

    /// Look up or create the struct/union body for `tag` declared directly in
    /// scope `scope_id`. Passing `tag = None` always creates a fresh,
    /// anonymous body. Returns the struct index embedded in `Ty::Struct`.
    pub fn declare_struct(&mut self, tag: Option<Id>, scope_id: u32, is_union: bool) -> u32 {
        if let Some(tag) = tag {
            if let Some(&idx) = self.by_tag.get(&(tag, scope_id)) {
                return idx;
            }
        }
        let idx = self.structs.len() as u32;
        self.structs.push(StructDef {
            tag,
            is_union,
            fields: Vec::new(),
            size: 0,
            align: 0,
            complete: false,
        });
        if let Some(tag) = tag {
            self.by_tag.insert((tag, scope_id), idx);
        }
        idx
    }

    pub fn struct_ty(idx: u32) -> Ty {
        Intern::new(TypeKind::Struct(idx))
    }

    pub fn struct_def(&self, idx: u32) -> &StructDef {
        &self.structs[idx as usize]
    }

    /// Fill in a struct/union body's fields and compute size/alignment by
    /// walking members in declaration order, applying natural alignment
    /// between members and trailing padding to the struct's own alignment
    /// (the original `xcc` does the same in its declarator pass).
    pub fn define_struct(&mut self, idx: u32, mut fields: Vec<Field>, is_union: bool) {
        let mut offset: u32 = 0;
        let mut align: u32 = 1;
        let mut bit_cursor: u32 = 0; // bits consumed in the current storage unit
        for f in fields.iter_mut() {
            let fa = self.align_of(f.ty);
            align = align.max(fa);
            if let Some(bf) = &f.bitfield {
                let unit_bits = self.size_of(f.ty) * 8;
                if bit_cursor + bf.width as u32 > unit_bits {
                    bit_cursor = 0;
                    offset = round_up(offset + unit_bits / 8, fa);
                }
                f.offset = offset;
                f.bitfield = Some(BitField {
                    width: bf.width,
                    bit_offset: bit_cursor as u8,
                });
                bit_cursor += bf.width as u32;
                if is_union {
                    bit_cursor = 0;
                }
                continue;
            }
            bit_cursor = 0;
            offset = round_up(offset, fa);
            f.offset = offset;
            if !is_union {
                offset += self.size_of(f.ty);
            }
        }
        let size = if is_union {
            fields
                .iter()
                .map(|f| self.size_of(f.ty))
                .max()
                .unwrap_or(0)
        } else {
            round_up(offset.max(if bit_cursor > 0 { offset + 1 } else { offset }), align)
        };
        let def = &mut self.structs[idx as usize];
        def.fields = fields;
        def.size = size.max(1);
        def.align = align;
        def.complete = true;
        def.is_union = is_union;
    }

    pub fn size_of(&self, ty: Ty) -> u32 {
        match &*ty {
            TypeKind::Void => 1,
            TypeKind::Fixnum { size, .. } => *size as u32,
            TypeKind::Flonum { size } => *size as u32,
            TypeKind::Pointer(_) => self.ptr_size as u32,
            TypeKind::Array(of, Some(n)) => self.size_of(*of) * (*n as u32),
            TypeKind::Array(_, None) => self.ptr_size as u32,
            TypeKind::Struct(idx) => self.struct_def(*idx).size,
            TypeKind::Function { .. } => self.ptr_size as u32,
            TypeKind::Qualified(inner, _) => self.size_of(*inner),
        }
    }

    pub fn align_of(&self, ty: Ty) -> u32 {
        match &*ty {
            TypeKind::Void => 1,
            TypeKind::Fixnum { size, .. } => *size as u32,
            TypeKind::Flonum { size } => *size as u32,
            TypeKind::Pointer(_) => self.ptr_size as u32,
            TypeKind::Array(of, _) => self.align_of(*of),
            TypeKind::Struct(idx) => self.struct_def(*idx).align.max(1),
            TypeKind::Function { .. } => self.ptr_size as u32,
            TypeKind::Qualified(inner, _) => self.align_of(*inner),
        }
    }

    pub fn find_field(&self, ty: Ty, name: Id) -> Option<Field> {
        let idx = match &*strip_qualifiers(ty) {
            TypeKind::Struct(idx) => *idx,
            _ => return None,
        };
        self.struct_def(idx)
            .fields
            .iter()
            .find(|f| f.name == name)
            .cloned()
    }
}

fn round_up(v: u32, align: u32) -> u32 {
    if align == 0 {
        return v;
    }
    (v + align - 1) / align * align
}

pub fn strip_qualifiers(ty: Ty) -> Ty {
    match &*ty {
        TypeKind::Qualified(inner, _) => strip_qualifiers(*inner),
        _ => ty,
    }
}

pub fn is_pointer(ty: Ty) -> bool {
    matches!(&*strip_qualifiers(ty), TypeKind::Pointer(_))
}

pub fn is_array(ty: Ty) -> bool {
    matches!(&*strip_qualifiers(ty), TypeKind::Array(_, _))
}

pub fn is_fixnum(ty: Ty) -> bool {
    matches!(&*strip_qualifiers(ty), TypeKind::Fixnum { .. })
}

pub fn is_flonum(ty: Ty) -> bool {
    matches!(&*strip_qualifiers(ty), TypeKind::Flonum { .. })
}

pub fn is_signed(ty: Ty) -> bool {
    match &*strip_qualifiers(ty) {
        TypeKind::Fixnum { signed, .. } => *signed,
        TypeKind::Pointer(_) => false,
        _ => true,
    }
}

pub fn is_struct(ty: Ty) -> bool {
    matches!(&*strip_qualifiers(ty), TypeKind::Struct(_))
}

/// The pointee of a pointer, or the element type of an array decayed to a
/// pointer. `None` for anything else.
pub fn pointee(ty: Ty) -> Option<Ty> {
    match &*strip_qualifiers(ty) {
        TypeKind::Pointer(to) => Some(*to),
        TypeKind::Array(of, _) => Some(*of),
        _ => None,
    }
}

/// Arrays and functions decay to pointers everywhere except as the direct
/// operand of `sizeof`/`&`; arrays in function-parameter position decay to
/// pointers too.
pub fn decay(ty: Ty) -> Ty {
    match &*strip_qualifiers(ty) {
        TypeKind::Array(of, _) => TypeTable::pointer(*of),
        TypeKind::Function { .. } => TypeTable::pointer(ty),
        _ => ty,
    }
}
