//! Conversion between engine values and [`DataValue`] trees

use rquickjs::{Array, Ctx, Object, Value};
use tickscript_data::{DataMap, DataValue};

/// Deepest nesting accepted when reading an engine value
pub const MAX_DEPTH: usize = 64;

/// Largest float magnitude folded back into an integer
const SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("value nested deeper than 64 levels")]
    TooDeep,

    #[error("cannot convert a {0} value")]
    Unsupported(&'static str),

    #[error("{0}")]
    Engine(#[from] rquickjs::Error),
}

/// Read an engine value into a host tree
///
/// `undefined` becomes `Null`. Functions inside objects are skipped; a bare
/// function converts to `Null`. Integral numbers become `Int`.
pub fn to_data(value: &Value<'_>) -> Result<DataValue, ConversionError> {
    read(value, 0)
}

fn read(value: &Value<'_>, depth: usize) -> Result<DataValue, ConversionError> {
    if depth > MAX_DEPTH {
        return Err(ConversionError::TooDeep);
    }

    if value.is_undefined() || value.is_null() || value.is_function() {
        return Ok(DataValue::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(DataValue::Bool(b));
    }
    if let Some(n) = value.as_int() {
        return Ok(DataValue::Int(n as i64));
    }
    if let Some(n) = value.as_float() {
        if n.fract() == 0.0 && n.abs() <= SAFE_INTEGER {
            return Ok(DataValue::Int(n as i64));
        }
        return Ok(DataValue::Float(n));
    }
    if let Some(s) = value.as_string() {
        return Ok(DataValue::from(s.to_string()?));
    }
    if let Some(array) = value.as_array() {
        let mut items = Vec::with_capacity(array.len());
        for item in array.iter::<Value>() {
            items.push(read(&item?, depth + 1)?);
        }
        return Ok(DataValue::list(items));
    }
    if let Some(object) = value.as_object() {
        let mut map = DataMap::new();
        for prop in object.props::<String, Value>() {
            let (key, item) = prop?;
            if item.is_function() {
                continue;
            }
            map.insert(key, read(&item, depth + 1)?);
        }
        return Ok(DataValue::from(map));
    }

    Err(ConversionError::Unsupported(value.type_name()))
}

/// Build an engine value from a host tree
///
/// Integers outside the `i32` range are passed as floats.
pub fn from_data<'js>(ctx: &Ctx<'js>, value: &DataValue) -> rquickjs::Result<Value<'js>> {
    Ok(match value {
        DataValue::Null => Value::new_null(ctx.clone()),
        DataValue::Bool(b) => Value::new_bool(ctx.clone(), *b),
        DataValue::Int(n) => match i32::try_from(*n) {
            Ok(small) => Value::new_int(ctx.clone(), small),
            Err(_) => Value::new_float(ctx.clone(), *n as f64),
        },
        DataValue::Float(n) => Value::new_float(ctx.clone(), *n),
        DataValue::String(s) => rquickjs::String::from_str(ctx.clone(), s)?.into_value(),
        DataValue::List(items) => {
            let array = Array::new(ctx.clone())?;
            for (index, item) in items.iter().enumerate() {
                array.set(index, from_data(ctx, item)?)?;
            }
            array.into_value()
        }
        DataValue::Map(map) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in map.iter() {
                object.set(key.as_str(), from_data(ctx, item)?)?;
            }
            object.into_value()
        }
    })
}

/// Read a list of call arguments
pub fn args_to_data(args: &[Value<'_>]) -> Result<Vec<DataValue>, ConversionError> {
    args.iter().map(to_data).collect()
}
