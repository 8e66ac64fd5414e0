//! Pattern-matching code suggestions.
//!
//! Pure lookup over static per-language tables. Tables are scanned in
//! declaration order, so earlier patterns win:
//!
//! 1. exact: the trimmed current line ends with the trimmed pattern
//! 2. partial: the trimmed pattern starts with the current line (longer
//!    than two characters), at 0.8× confidence
//! 3. otherwise a generic low-confidence hint

use serde::Serialize;

/// (pattern, suggestion, confidence)
type Entry = (&'static str, &'static str, f64);

const PARTIAL_MATCH_FACTOR: f64 = 0.8;
const MIN_PARTIAL_LEN: usize = 2;

pub const FALLBACK_SUGGESTION: &str = "# Continue coding...";
pub const FALLBACK_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub suggestion: String,
    pub confidence: f64,
}

const PYTHON: &[Entry] = &[
    // definitions
    ("def ", "function_name(arg1, arg2):\n    \"\"\"\n    Function description\n    \"\"\"\n    pass", 0.92),
    ("def main", "def main():\n    \"\"\"\n    Main entry point\n    \"\"\"\n    pass\n\nif __name__ == '__main__':\n    main()", 0.95),
    ("async def ", "async_function():\n    \"\"\"\n    Async function\n    \"\"\"\n    await something()", 0.90),
    ("class ", "ClassName:\n    \"\"\"\n    Class description\n    \"\"\"\n    def __init__(self, param):\n        self.param = param\n    \n    def method(self):\n        pass", 0.93),
    // loops
    ("for ", "i in range(10):\n    print(i)", 0.94),
    ("for i in range", "for i in range(len(items)):\n    print(items[i])", 0.92),
    ("for item in ", "for item in items:\n    print(item)", 0.93),
    ("while ", "condition:\n    # Loop body\n    pass", 0.90),
    ("while True", "while True:\n    # Infinite loop\n    break  # Exit condition", 0.91),
    // conditionals
    ("if ", "condition:\n    # True block\n    pass", 0.93),
    ("if __name__", "if __name__ == '__main__':\n    main()", 0.96),
    ("elif ", "condition:\n    # Elif block\n    pass", 0.91),
    ("else", "else:\n    # Else block\n    pass", 0.92),
    // exceptions
    ("try", "try:\n    # Try block\n    pass\nexcept Exception as e:\n    print(f'Error: {e}')", 0.94),
    ("except", "except Exception as e:\n    print(f'Error: {e}')", 0.93),
    ("finally", "finally:\n    # Cleanup code\n    pass", 0.91),
    // context managers
    ("with ", "open('file.txt', 'r') as f:\n    content = f.read()", 0.92),
    ("with open", "with open('file.txt', 'r') as f:\n    content = f.read()", 0.94),
    // imports
    ("import ", "numpy as np", 0.85),
    ("import numpy", "import numpy as np", 0.95),
    ("import pandas", "import pandas as pd", 0.95),
    ("import matplotlib", "import matplotlib.pyplot as plt", 0.94),
    ("from ", "module import function", 0.86),
    ("from typing", "from typing import List, Dict, Optional", 0.93),
    // builtins and statements
    ("print", "print()", 0.96),
    ("print(", "print(f'')", 0.94),
    ("return", "return result", 0.93),
    ("return None", "return None", 0.92),
    ("raise ", "ValueError('Invalid input')", 0.91),
    ("assert ", "condition, 'Error message'", 0.90),
    // comprehensions and literals
    ("[", "[x for x in items if condition]", 0.88),
    ("[x for", "[x for x in items if condition]", 0.91),
    ("{", "{'key': 'value'}", 0.87),
    ("lambda", "lambda x: x * 2", 0.90),
    ("lambda x", "lambda x: x * 2", 0.92),
    // decorators
    ("@", "decorator\ndef function():\n    pass", 0.89),
    ("@property", "@property\ndef property_name(self):\n    return self._value", 0.93),
    ("@staticmethod", "@staticmethod\ndef static_method():\n    pass", 0.92),
    ("@classmethod", "@classmethod\ndef class_method(cls):\n    pass", 0.92),
    // strings and files
    ("f'", "f'{variable}'", 0.93),
    ("f\"", "f\"{variable}\"", 0.93),
    ("open(", "open('filename.txt', 'r') as f:\n    content = f.read()", 0.92),
    // containers
    ("list", "list_name = []", 0.88),
    ("dict", "dict_name = {}", 0.88),
    ("set", "set_name = set()", 0.87),
    ("tuple", "tuple_name = ()", 0.87),
    // common patterns
    ("if not ", "if not condition:\n    pass", 0.91),
    ("is None", "is None:", 0.92),
    ("is not None", "is not None:", 0.92),
    ("in range", "in range(10):", 0.93),
    ("await ", "await async_function()", 0.91),
    // type hints
    ("-> ", "-> ReturnType:", 0.89),
    (": List", ": List[str]", 0.90),
    (": Dict", ": Dict[str, Any]", 0.90),
    // methods
    (".append", ".append(item)", 0.93),
    (".extend", ".extend(items)", 0.92),
    (".split", ".split(',')", 0.93),
    (".join", ".join(items)", 0.92),
    (".strip", ".strip()", 0.93),
    (".format", ".format(arg1, arg2)", 0.91),
    (".get", ".get('key', default_value)", 0.92),
    // operators
    ("and ", "and condition", 0.91),
    ("or ", "or condition", 0.91),
    ("not ", "not condition", 0.91),
    // libraries
    ("pd.", "pd.read_csv('file.csv')", 0.89),
    ("np.", "np.array([1, 2, 3])", 0.89),
    ("plt.", "plt.plot(x, y)", 0.89),
];

const JAVASCRIPT: &[Entry] = &[
    ("function ", "functionName(param1, param2) {\n    // Function body\n    return result;\n}", 0.92),
    ("const ", "variableName = value;", 0.90),
    ("let ", "variableName = value;", 0.90),
    ("var ", "variableName = value;", 0.88),
    ("=> ", "(param) => {\n    return result;\n}", 0.91),
    ("for ", "(let i = 0; i < array.length; i++) {\n    console.log(array[i]);\n}", 0.93),
    ("for (let", "for (let i = 0; i < array.length; i++) {\n    console.log(array[i]);\n}", 0.94),
    ("forEach", "forEach((item) => {\n    console.log(item);\n});", 0.92),
    ("while ", "(condition) {\n    // Loop body\n}", 0.90),
    ("if ", "(condition) {\n    // True block\n}", 0.92),
    ("else if", "else if (condition) {\n    // Else if block\n}", 0.91),
    ("else", "else {\n    // Else block\n}", 0.91),
    ("try", "try {\n    // Try block\n} catch (error) {\n    console.error(error);\n}", 0.93),
    ("catch", "catch (error) {\n    console.error(error);\n}", 0.92),
    ("async ", "async function() {\n    const result = await asyncOperation();\n    return result;\n}", 0.92),
    ("await ", "await asyncOperation()", 0.93),
    ("console.log", "console.log()", 0.95),
    ("return", "return result;", 0.92),
];

const GENERIC: &[Entry] = &[
    ("function", "function_name() {\n    // Function body\n}", 0.85),
    ("if", "if (condition) {\n    // Code block\n}", 0.85),
    ("for", "for (i = 0; i < n; i++) {\n    // Loop body\n}", 0.85),
    ("while", "while (condition) {\n    // Loop body\n}", 0.85),
];

fn table(language: &str) -> &'static [Entry] {
    match language {
        "python" => PYTHON,
        "javascript" | "typescript" => JAVASCRIPT,
        _ => GENERIC,
    }
}

/// Suggest a completion for the line under `cursor` (a character offset).
///
/// A cursor past the end of `code` reads the whole buffer.
pub fn suggest(code: &str, cursor: usize, language: &str) -> Suggestion {
    let before_cursor = match code.char_indices().nth(cursor) {
        Some((byte, _)) => &code[..byte],
        None => code,
    };
    let current_line = before_cursor.rsplit('\n').next().unwrap_or("").trim();
    let entries = table(language);

    if let Some((_, suggestion, confidence)) = entries
        .iter()
        .find(|(pattern, _, _)| current_line.ends_with(pattern.trim()))
    {
        return Suggestion {
            suggestion: (*suggestion).to_string(),
            confidence: *confidence,
        };
    }

    if current_line.chars().count() > MIN_PARTIAL_LEN {
        if let Some((_, suggestion, confidence)) = entries
            .iter()
            .find(|(pattern, _, _)| pattern.trim().starts_with(current_line))
        {
            return Suggestion {
                suggestion: (*suggestion).to_string(),
                confidence: confidence * PARTIAL_MATCH_FACTOR,
            };
        }
    }

    Suggestion {
        suggestion: FALLBACK_SUGGESTION.to_string(),
        confidence: FALLBACK_CONFIDENCE,
    }
}
