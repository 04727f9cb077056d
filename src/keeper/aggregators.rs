//! The reply folds used by broadcast and consistent-hash routes. All of them
//! are pure binary functions over the dispatch boundary value, folded
//! left-to-right over successful replies in node order. A method registers
//! exactly one of them; they carry no state between calls.

use serde_cbor::Value;

/// A binary reply fold.
pub type Aggregator = fn(Value, Value) -> Value;

/// Both-true AND, for folding acknowledgements. Non-boolean operands keep
/// the accumulator unchanged.
pub fn all_and(a: Value, b: Value) -> Value {
  match (a, b) {
    (Value::Bool(x), Value::Bool(y)) => Value::Bool(x && y),
    (x, _) => x,
  }
}

/// Sequence concatenation preserving encounter order.
pub fn concat(a: Value, b: Value) -> Value {
  match (a, b) {
    (Value::Array(mut x), Value::Array(y)) => {
      x.extend(y);
      Value::Array(x)
    }
    (x, _) => x,
  }
}

/// Recursive union of nested maps. On a key collision the right side wins,
/// except that two maps merge rather than replace.
pub fn merge(a: Value, b: Value) -> Value {
  match (a, b) {
    (Value::Map(mut x), Value::Map(y)) => {
      for (k, v) in y {
        let v = match x.remove(&k) {
          Some(old) => merge(old, v),
          None => v,
        };
        x.insert(k, v);
      }
      Value::Map(x)
    }
    (_, y) => y,
  }
}

/// Identity fold: the first reply wins, further ones are redundant.
pub fn pass(a: Value, _b: Value) -> Value {
  a
}

#[cfg(test)]
use maplit::btreemap;

#[cfg(test)]
fn text(s: &str) -> Value {
  Value::Text(s.to_string())
}

#[test]
fn test_all_and() {
  assert_eq!(
    all_and(Value::Bool(true), Value::Bool(true)),
    Value::Bool(true)
  );
  assert_eq!(
    all_and(Value::Bool(true), Value::Bool(false)),
    Value::Bool(false)
  );
  assert_eq!(
    all_and(Value::Bool(false), Value::Bool(true)),
    Value::Bool(false)
  );
}

#[test]
fn test_concat_keeps_order() {
  let a = Value::Array(vec![text("a"), text("b")]);
  let b = Value::Array(vec![text("c")]);
  let folded = concat(concat(a, b), Value::Array(vec![]));
  assert_eq!(folded, Value::Array(vec![text("a"), text("b"), text("c")]));
}

#[test]
fn test_merge_right_wins() {
  let a = Value::Map(btreemap! {
    text("n1") => Value::Map(btreemap! {
      text("uptime") => text("10"),
      text("rows") => text("3"),
    }),
  });
  let b = Value::Map(btreemap! {
    text("n1") => Value::Map(btreemap! { text("rows") => text("4") }),
    text("n2") => Value::Map(btreemap! { text("rows") => text("4") }),
  });
  // nested keys union, collisions take the right side
  let expected = Value::Map(btreemap! {
    text("n1") => Value::Map(btreemap! {
      text("uptime") => text("10"),
      text("rows") => text("4"),
    }),
    text("n2") => Value::Map(btreemap! { text("rows") => text("4") }),
  });
  assert_eq!(merge(a, b), expected);
}

#[test]
fn test_pass_first_wins() {
  assert_eq!(pass(text("one"), text("two")), text("one"));
}
